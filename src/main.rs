use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use glass_scout::{
    ActionEngine, ActionRegistry, Agent, AgentConfig, BrowserConfig, ChromiumDriver, DiskTrajectoryStore, EngineConfig,
    LanguageModel, LlmScorer, LlmWorldModel, OpenAiClient, OpenAiConfig, RetrieverPipeline, RunStatus, SearchConfig,
    TreeSearch,
};
use nanoid::nanoid;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "glass-scout", version, about = "Drive a browser towards an objective")]
struct Cli {
    /// Page the run starts from.
    url: String,
    /// What the agent should achieve, in plain language.
    objective: String,
    /// Write the final trajectory as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Keep a per-run directory with the trajectory and step screenshots.
    #[arg(long)]
    store_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    n_steps: usize,
    #[arg(long, default_value_t = 1)]
    max_depth: usize,
    /// 1 disables tree search.
    #[arg(long, default_value_t = 1)]
    branching_factor: usize,
    #[arg(long, default_value_t = 1)]
    sample_size: usize,
    #[arg(long)]
    headed: bool,
    #[arg(long)]
    screenshots: bool,
    /// Deadline for each model and browser call.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

async fn build_agent(cli: &Cli) -> Result<Agent<ChromiumDriver, LlmWorldModel>> {
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));
    let agent_cfg = AgentConfig { n_steps: cli.n_steps, ..AgentConfig::default() };
    let search_cfg = SearchConfig {
        max_depth: cli.max_depth,
        branching_factor: cli.branching_factor,
        sample_size: cli.sample_size,
    };
    agent_cfg.validate()?;
    search_cfg.validate()?;

    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(OpenAiConfig::default())?);
    let retriever = Arc::new(RetrieverPipeline::default());
    let registry = Arc::new(ActionRegistry::with_defaults());
    let engine_cfg = EngineConfig { llm_timeout: timeout, driver_timeout: timeout, ..EngineConfig::default() };
    let engine = ActionEngine::new(llm.clone(), retriever.clone(), registry, engine_cfg);
    let world_model = LlmWorldModel::new(llm.clone()).with_retriever(retriever).with_timeout(timeout);

    let driver = ChromiumDriver::launch(BrowserConfig {
        headless: !cli.headed,
        viewport: agent_cfg.viewport,
        screenshots: cli.screenshots,
        ..BrowserConfig::default()
    })
    .await
    .context("launching chromium")?;

    let mut agent = Agent::new(driver, world_model, engine, agent_cfg)?;
    if search_cfg.branching_factor > 1 {
        let scorer = Arc::new(LlmScorer::new(llm).with_timeout(timeout));
        agent = agent.with_tree_search(TreeSearch::new(search_cfg, scorer)?);
    }
    if let Some(dir) = &cli.store_dir {
        agent = agent.with_store(Arc::new(DiskTrajectoryStore::new(dir)));
    }
    Ok(agent)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let agent = match build_agent(&cli).await {
        Ok(a) => a,
        Err(e) => {
            error!("startup failed: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let trajectory = match agent.run_with(nanoid!(), &cli.objective, &cli.url, cancel).await {
        Ok(t) => t,
        Err(e) => {
            error!("run aborted: {}", e);
            return ExitCode::from(1);
        }
    };
    info!(status = ?trajectory.status, actions = trajectory.actions.len(), output = ?trajectory.output, "done");

    if let Some(path) = &cli.output {
        if let Err(e) = trajectory.write_to_file(path).await {
            error!("writing {}: {}", path.display(), e);
            return ExitCode::from(1);
        }
    }
    if let Some(out) = &trajectory.output {
        println!("{}", out);
    }
    if trajectory.status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

use std::sync::Arc;

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::{Action, ActionRegistry};
use crate::driver::{within, Driver, PageState};
use crate::engine::{ActionEngine, ExecutionResult};
use crate::error::{AgentError, Attempt, DriverError, RetryBudget};
use crate::search::TreeSearch;
use crate::trajectory::{NullTrajectoryStore, RunStatus, Trajectory, TrajectoryStore};
use crate::world_model::{History, Instruction, WorldModel};

// ========================= Agent Core =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Committed steps allowed per run.
    pub n_steps: usize,
    /// World-model answers tried before a planning failure ends the run.
    pub planning_retries: usize,
    /// Proposal + execution attempts per linear step.
    pub step_retries: usize,
    pub max_consecutive_failures: usize,
    /// A committed extraction with text ends the run successfully.
    pub finish_on_extraction: bool,
    pub viewport: (u32, u32),
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            n_steps: 10,
            planning_retries: 2,
            step_retries: 2,
            max_consecutive_failures: 3,
            finish_on_extraction: true,
            viewport: (1280, 800),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        let bounds = [
            ("n_steps", self.n_steps),
            ("planning_retries", self.planning_retries),
            ("step_retries", self.step_retries),
            ("max_consecutive_failures", self.max_consecutive_failures),
        ];
        for (name, value) in bounds {
            if value < 1 {
                return Err(AgentError::configuration(format!("{} must be >= 1", name)));
            }
        }
        Ok(())
    }
}

/// Drives one browser session from an objective to a terminal trajectory.
pub struct Agent<D, W>
where
    D: Driver,
    W: WorldModel,
{
    driver: D,
    world_model: W,
    engine: ActionEngine,
    cfg: AgentConfig,
    search: Option<TreeSearch>,
    store: Arc<dyn TrajectoryStore>,
}

impl<D, W> Agent<D, W>
where
    D: Driver,
    W: WorldModel,
{
    pub fn new(driver: D, world_model: W, engine: ActionEngine, cfg: AgentConfig) -> Result<Self, AgentError> {
        cfg.validate()?;
        Ok(Self {
            driver,
            world_model,
            engine,
            cfg,
            search: None,
            store: Arc::new(NullTrajectoryStore),
        })
    }

    pub fn with_tree_search(mut self, search: TreeSearch) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TrajectoryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn registry(&self) -> &ActionRegistry {
        self.engine.registry()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub async fn run(&self, objective: &str, start_url: &str) -> Result<Trajectory, AgentError> {
        self.run_with(nanoid!(), objective, start_url, CancellationToken::new()).await
    }

    /// Runs to a terminal status. Only store failures are returned as errors;
    /// everything else ends up in the trajectory.
    pub async fn run_with(
        &self,
        run_id: impl Into<String>,
        objective: &str,
        start_url: &str,
        cancel: CancellationToken,
    ) -> Result<Trajectory, AgentError> {
        let mut trajectory = Trajectory::new(run_id, start_url, objective, self.cfg.viewport);
        self.store.write_run_start(&trajectory).await?;
        info!(run_id = %trajectory.run_id, objective, start_url, "run started");

        if let Err(e) = self.timed(self.driver.navigate(start_url)).await {
            return self.finish(trajectory, RunStatus::Failed, None, Some(e.into())).await;
        }

        let mut history = History::default();
        let mut consecutive_failures = 0usize;
        for i in 0..self.cfg.n_steps {
            if cancel.is_cancelled() {
                return self.finish(trajectory, RunStatus::Cancelled, None, Some(AgentError::Cancelled)).await;
            }
            let page = match self.timed(self.driver.page_state()).await {
                Ok(p) => p,
                Err(e) => return self.finish(trajectory, RunStatus::Failed, None, Some(e.into())).await,
            };

            let instruction = match self.plan(objective, &page, &history).await {
                Ok(ins) => ins,
                Err(e) => {
                    warn!(step = i, error = %e, "planning failed");
                    return self.finish(trajectory, RunStatus::Failed, None, Some(e)).await;
                }
            };
            trajectory.note_instruction(&instruction.text)?;
            info!(step = i, engine = %instruction.engine, instruction = %instruction.text, "agent step");

            if instruction.is_complete() {
                let output = Some(instruction.text.clone()).filter(|t| !t.is_empty());
                return self.finish(trajectory, RunStatus::Success, output, None).await;
            }

            match self.step(i, objective, &instruction, &page, &history).await {
                Ok((action, result)) => {
                    consecutive_failures = 0;
                    history.record(&instruction, true, result.produced_text.as_deref());
                    let shot = self.timed(self.driver.page_state()).await.ok().and_then(|p| p.screenshot_b64);
                    trajectory.commit(action.clone())?;
                    self.store.write_action(&trajectory, &action, shot.as_deref()).await?;
                    info!(step = i, kind = %action.kind, step_id = %action.step_id, url = %action.url, "action committed");

                    if self.cfg.finish_on_extraction {
                        if let Some(text) = action.extracted_text() {
                            let output = Some(text.to_string());
                            return self.finish(trajectory, RunStatus::Success, output, None).await;
                        }
                    }
                }
                Err(e) => {
                    warn!("step {} failed: {}", i, e);
                    history.record(&instruction, false, None);
                    consecutive_failures += 1;
                    if consecutive_failures >= self.cfg.max_consecutive_failures {
                        return self.finish(trajectory, RunStatus::Failed, None, Some(e)).await;
                    }
                    trajectory.note_error(e)?;
                }
            }
        }

        if cancel.is_cancelled() {
            return self.finish(trajectory, RunStatus::Cancelled, None, Some(AgentError::Cancelled)).await;
        }
        if let Some(done) = self.final_check(objective, &history).await {
            let output = Some(done.text).filter(|t| !t.is_empty());
            return self.finish(trajectory, RunStatus::Success, output, None).await;
        }
        let reason = AgentError::Timeout { message: format!("step budget of {} exhausted", self.cfg.n_steps) };
        let error = if trajectory.last_error.is_none() { Some(reason) } else { None };
        self.finish(trajectory, RunStatus::TimedOut, None, error).await
    }

    /// Driver calls share the engine's deadline.
    async fn timed<T, F>(&self, fut: F) -> Result<T, DriverError>
    where
        F: std::future::Future<Output = Result<T, DriverError>>,
    {
        within(self.engine.driver_timeout(), fut).await
    }

    async fn plan(&self, objective: &str, page: &PageState, history: &History) -> Result<Instruction, AgentError> {
        let mut budget = RetryBudget::new(self.cfg.planning_retries);
        loop {
            let attempt = self.world_model.propose_instruction(objective, page, history).await;
            match budget.record(Attempt::from(attempt)) {
                Ok(ins) => return Ok(ins),
                Err(Some(e)) => return Err(e),
                Err(None) => {
                    let last = budget.last_error().map(|e| e.to_string()).unwrap_or_default();
                    warn!(attempt = budget.used(), error = %last, "instruction rejected, asking again");
                }
            }
        }
    }

    /// One last look at the page once the step budget is spent.
    async fn final_check(&self, objective: &str, history: &History) -> Option<Instruction> {
        let page = self.timed(self.driver.page_state()).await.ok()?;
        match self.world_model.propose_instruction(objective, &page, history).await {
            Ok(ins) if ins.is_complete() => Some(ins),
            _ => None,
        }
    }

    async fn step(
        &self,
        i: usize,
        objective: &str,
        instruction: &Instruction,
        page: &PageState,
        history: &History,
    ) -> Result<(Action, ExecutionResult), AgentError> {
        match &self.search {
            Some(search) if search.config().branching_factor > 1 => {
                let outcome = search
                    .expand(i, objective, instruction, history, &self.world_model, &self.engine, &self.driver)
                    .await?;
                Ok((outcome.action, outcome.result))
            }
            _ => self.linear_step(instruction, page).await,
        }
    }

    async fn linear_step(
        &self,
        instruction: &Instruction,
        page: &PageState,
    ) -> Result<(Action, ExecutionResult), AgentError> {
        let mut budget = RetryBudget::new(self.cfg.step_retries);
        let mut page = page.clone();
        loop {
            let attempt = match self.engine.propose_action(instruction, &page).await {
                Ok(action) => {
                    let (action, result) = self.engine.execute(&self.driver, action).await;
                    match result.error.clone() {
                        None if result.success => Ok((action, result)),
                        error => Err(AgentError::Execution {
                            error: error.unwrap_or_else(|| DriverError::Other("action failed".into())),
                        }),
                    }
                }
                Err(e) => Err(e),
            };
            match budget.record(Attempt::from(attempt)) {
                Ok(done) => return Ok(done),
                Err(Some(e)) => return Err(e),
                Err(None) => {
                    let last = budget.last_error().map(|e| e.to_string()).unwrap_or_default();
                    warn!(attempt = budget.used(), error = %last, "step attempt failed, retrying");
                    if let Ok(fresh) = self.timed(self.driver.page_state()).await {
                        page = fresh;
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        mut trajectory: Trajectory,
        status: RunStatus,
        output: Option<String>,
        error: Option<AgentError>,
    ) -> Result<Trajectory, AgentError> {
        if let Some(e) = error {
            trajectory.note_error(e)?;
        }
        trajectory.finish(status, output)?;
        self.store.write_run_end(&trajectory).await?;
        info!(
            run_id = %trajectory.run_id,
            status = ?trajectory.status,
            actions = trajectory.actions.len(),
            "run finished"
        );
        Ok(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::retriever::RetrieverPipeline;
    use crate::sim::{ScriptedModel, SimElement, SimPage, SimulatedDriver};
    use crate::world_model::LlmWorldModel;

    const EXTRACT_PRICE: &str =
        r#"{"kind": "web_extraction", "payload": {"locator": "//span[@id='price']", "description": "price"}}"#;

    fn shop() -> SimulatedDriver {
        SimulatedDriver::new().with_page(
            SimPage::new("https://shop.test", "Shop")
                .element("//span[@id='price']", SimElement::new("span", "4 EUR")),
        )
    }

    fn agent(planner: ScriptedModel, actor: ScriptedModel, cfg: AgentConfig) -> Agent<SimulatedDriver, LlmWorldModel> {
        let engine = ActionEngine::new(
            Arc::new(actor),
            Arc::new(RetrieverPipeline::default()),
            Arc::new(ActionRegistry::with_defaults()),
            EngineConfig { settle_delay: Duration::ZERO, ..EngineConfig::default() },
        );
        Agent::new(shop(), LlmWorldModel::new(Arc::new(planner)), engine, cfg).unwrap()
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let cfg = AgentConfig { planning_retries: 0, ..AgentConfig::default() };
        assert!(matches!(cfg.validate(), Err(AgentError::Configuration { .. })));
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn extraction_with_text_finishes_the_run() {
        let planner = ScriptedModel::new(["Next engine: Extraction Engine\nInstruction: Read the price"]);
        let a = agent(planner, ScriptedModel::new([EXTRACT_PRICE]), AgentConfig::default());
        let t = a.run("find the price", "https://shop.test").await.unwrap();
        assert_eq!(t.status, RunStatus::Success);
        assert_eq!(t.output.as_deref(), Some("4 EUR"));
        assert_eq!(t.actions.len(), 1);
        assert_eq!(t.last_instruction.as_deref(), Some("Read the price"));
    }

    #[tokio::test]
    async fn repeated_step_failures_fail_the_run() {
        let planner = ScriptedModel::from_fn(|_| Ok("Next engine: Navigation Engine\nInstruction: Click buy".into()));
        let actor = ScriptedModel::from_fn(|_| {
            Ok(r#"{"kind": "web_navigation", "payload": {"command": "click", "locator": "//button[@id='buy']"}}"#.into())
        });
        let cfg = AgentConfig { max_consecutive_failures: 2, ..AgentConfig::default() };
        let t = agent(planner, actor, cfg).run("buy", "https://shop.test").await.unwrap();
        assert_eq!(t.status, RunStatus::Failed);
        assert!(t.actions.is_empty());
        assert!(matches!(t.last_error, Some(AgentError::Execution { .. })));
    }

    #[tokio::test]
    async fn exhausted_budget_without_completion_times_out() {
        let planner = ScriptedModel::from_fn(|_| Ok("Next engine: Navigation Controls\nInstruction: Scroll down".into()));
        let actor = ScriptedModel::from_fn(|_| {
            Ok(r#"{"kind": "web_control", "payload": {"command": "scroll_down"}}"#.into())
        });
        let cfg = AgentConfig { n_steps: 2, ..AgentConfig::default() };
        let t = agent(planner, actor, cfg).run("look around", "https://shop.test").await.unwrap();
        assert_eq!(t.status, RunStatus::TimedOut);
        assert_eq!(t.actions.len(), 2);
        assert!(matches!(t.last_error, Some(AgentError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancelled_before_first_step() {
        let a = agent(ScriptedModel::new(Vec::<String>::new()), ScriptedModel::new(Vec::<String>::new()), AgentConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let t = a.run_with("run-1", "x", "https://shop.test", cancel).await.unwrap();
        assert_eq!(t.status, RunStatus::Cancelled);
        assert_eq!(t.last_error, Some(AgentError::Cancelled));
        assert!(t.actions.is_empty());
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glass_scout::action::{ActionPayload, ActionStatus};
use glass_scout::driver::Driver;
use glass_scout::search::{SearchConfig, TreeSearch};
use glass_scout::sim::{SimElement, SimPage};
use glass_scout::world_model::History;
use glass_scout::{
    ActionEngine, ActionRegistry, Agent, AgentConfig, AgentError, Engine, EngineConfig, FnScorer, Instruction,
    LlmWorldModel, RetrieverPipeline, RunStatus, ScriptedModel, SimulatedDriver,
};

const LONG: &str = "//span[@id='long']";
const SHORT: &str = "//span[@id='short']";
const MID: &str = "//span[@id='mid']";

fn catalog() -> SimulatedDriver {
    SimulatedDriver::new().with_page(
        SimPage::new("https://shop.test", "Shop")
            .element(LONG, SimElement::new("span", "Hand-poured soy candle, 4 EUR"))
            .element(SHORT, SimElement::new("span", "4 EUR"))
            .element(MID, SimElement::new("span", "Price: 4 EUR")),
    )
}

fn extract(locator: &str) -> String {
    format!(
        r#"{{"kind": "web_extraction", "payload": {{"locator": "{}", "description": "price"}}}}"#,
        locator
    )
}

/// Three extractions for the first expansion, `pass` for every deeper one.
fn actor() -> ScriptedModel {
    let calls = Arc::new(AtomicUsize::new(0));
    ScriptedModel::from_fn(move |_| {
        let answer = match calls.fetch_add(1, Ordering::SeqCst) {
            0 => extract(LONG),
            1 => extract(SHORT),
            2 => extract(MID),
            _ => r#"{"kind": "web_navigation", "payload": {"command": "pass", "locator": ""}}"#.to_string(),
        };
        Ok(answer)
    })
}

fn engine(actor: ScriptedModel) -> ActionEngine {
    engine_with(actor, EngineConfig { settle_delay: Duration::ZERO, ..EngineConfig::default() })
}

fn engine_with(actor: ScriptedModel, cfg: EngineConfig) -> ActionEngine {
    ActionEngine::new(
        Arc::new(actor),
        Arc::new(RetrieverPipeline::default()),
        Arc::new(ActionRegistry::with_defaults()),
        cfg,
    )
}

fn shorter_text_scorer() -> Arc<FnScorer> {
    Arc::new(FnScorer::new(|_, result, _| {
        -(result.produced_text.as_deref().map(|t| t.len()).unwrap_or(0) as f64)
    }))
}

fn planner() -> LlmWorldModel {
    LlmWorldModel::new(Arc::new(ScriptedModel::from_fn(|_| {
        Ok("Next engine: Navigation Engine\nInstruction: Stay on the page".into())
    })))
}

#[tokio::test]
async fn shallowest_best_node_is_committed() {
    let driver = catalog();
    driver.navigate("https://shop.test").await.unwrap();
    let search = TreeSearch::new(
        SearchConfig { max_depth: 2, branching_factor: 3, sample_size: 2 },
        shorter_text_scorer(),
    )
    .unwrap();
    let ins = Instruction::new(Engine::Extraction, "Read the price");

    let outcome = search
        .expand(0, "find the price", &ins, &History::default(), &planner(), &engine(actor()), &driver)
        .await
        .unwrap();

    // depth 1: long, short, mid; depth 2: three passes under each retained node
    assert_eq!(outcome.tree.at_depth(1).count(), 3);
    assert_eq!(outcome.tree.at_depth(2).count(), 6);
    assert_eq!(outcome.chosen, 1);
    let best = &outcome.tree.nodes[outcome.chosen];
    assert_eq!(best.depth, 1);
    assert_eq!(best.cumulative, -5.0);
    match &outcome.action.payload {
        ActionPayload::Extraction(p) => {
            assert_eq!(p.locator, SHORT);
            assert_eq!(p.text, "4 EUR");
        }
        other => panic!("unexpected payload {:?}", other),
    }
    // the long branch is pruned after depth 1
    assert!(!outcome.tree.nodes[0].retained);
    assert_eq!(driver.live_snapshots().await, 0);
    assert_eq!(driver.current_url().await.as_deref(), Some("https://shop.test"));
}

#[tokio::test]
async fn search_agent_commits_only_the_first_action() {
    let search = TreeSearch::new(
        SearchConfig { max_depth: 2, branching_factor: 3, sample_size: 2 },
        shorter_text_scorer(),
    )
    .unwrap();
    let world = LlmWorldModel::new(Arc::new(ScriptedModel::from_fn(|_| {
        Ok("Next engine: Extraction Engine\nInstruction: Read the price".into())
    })));
    let agent = Agent::new(catalog(), world, engine(actor()), AgentConfig::default())
        .unwrap()
        .with_tree_search(search);

    let t = agent.run("find the price", "https://shop.test").await.unwrap();

    assert_eq!(t.status, RunStatus::Success);
    assert_eq!(t.actions.len(), 1);
    assert_eq!(t.output.as_deref(), Some("4 EUR"));
    assert_eq!(agent.driver().live_snapshots().await, 0);
}

#[tokio::test]
async fn failing_candidates_leave_the_trajectory_untouched() {
    let search = TreeSearch::new(SearchConfig { max_depth: 1, branching_factor: 2, sample_size: 1 }, shorter_text_scorer())
        .unwrap();
    let world = LlmWorldModel::new(Arc::new(ScriptedModel::from_fn(|_| {
        Ok("Next engine: Navigation Engine\nInstruction: Click checkout".into())
    })));
    let missing = ScriptedModel::from_fn(|_| {
        Ok(r#"{"kind": "web_navigation", "payload": {"command": "click", "locator": "//button[@id='checkout']"}}"#.into())
    });
    let cfg = AgentConfig { max_consecutive_failures: 2, ..AgentConfig::default() };
    let agent = Agent::new(catalog(), world, engine(missing), cfg).unwrap().with_tree_search(search);

    let t = agent.run("check out", "https://shop.test").await.unwrap();

    assert_eq!(t.status, RunStatus::Failed);
    assert!(t.actions.is_empty());
    assert_eq!(t.last_error, Some(AgentError::SearchExhausted { step: 1 }));
    assert_eq!(agent.driver().live_snapshots().await, 0);
}

const QUERY: &str = "//input[@id='q']";

fn set_query(value: &str) -> String {
    format!(
        r#"{{"kind": "web_navigation", "payload": {{"command": "set_value", "locator": "{}", "value": "{}"}}}}"#,
        QUERY, value
    )
}

#[tokio::test]
async fn committed_value_survives_a_lossy_restore() {
    let driver = SimulatedDriver::new()
        .with_page(SimPage::new("https://shop.test", "Shop").element(QUERY, SimElement::input()))
        .with_lossy_restore();
    driver.navigate("https://shop.test").await.unwrap();
    let prefers_candle = Arc::new(FnScorer::new(|action, _, _| match &action.payload {
        ActionPayload::Navigation(p) if p.value.as_deref() == Some("candle") => 1.0,
        _ => 0.0,
    }));
    let search =
        TreeSearch::new(SearchConfig { max_depth: 1, branching_factor: 2, sample_size: 2 }, prefers_candle).unwrap();
    let actor = ScriptedModel::new([set_query("soap"), set_query("candle")]);
    let ins = Instruction::new(Engine::Navigation, "Type candle into the search box");

    let outcome = search
        .expand(0, "search for candles", &ins, &History::default(), &planner(), &engine(actor), &driver)
        .await
        .unwrap();

    assert_eq!(outcome.action.status, ActionStatus::Executed);
    let page = driver.page_state().await.unwrap();
    assert!(page.html.contains(r#"value="candle""#), "live page lost the committed value: {}", page.html);
    assert_eq!(driver.events().await.last(), Some(&format!("set_value {} = candle", QUERY)));
    assert_eq!(driver.live_snapshots().await, 0);
}

#[tokio::test]
async fn stalled_restore_is_cut_off_by_the_driver_deadline() {
    let driver = catalog().with_stalled_restore();
    driver.navigate("https://shop.test").await.unwrap();
    let search = TreeSearch::new(
        SearchConfig { max_depth: 2, branching_factor: 3, sample_size: 2 },
        shorter_text_scorer(),
    )
    .unwrap();
    let eng = engine_with(
        actor(),
        EngineConfig { settle_delay: Duration::ZERO, driver_timeout: Duration::from_millis(50), ..EngineConfig::default() },
    );
    let ins = Instruction::new(Engine::Extraction, "Read the price");
    let world = planner();

    let res = tokio::time::timeout(
        Duration::from_secs(2),
        search.expand(0, "find the price", &ins, &History::default(), &world, &eng, &driver),
    )
    .await
    .expect("expansion outlived its driver deadline");

    assert!(matches!(res, Err(AgentError::SearchExhausted { step: 0 })));
    assert_eq!(driver.live_snapshots().await, 0);
}

#[tokio::test]
async fn agent_run_ends_when_restores_stall() {
    let search = TreeSearch::new(
        SearchConfig { max_depth: 2, branching_factor: 3, sample_size: 2 },
        shorter_text_scorer(),
    )
    .unwrap();
    let world = LlmWorldModel::new(Arc::new(ScriptedModel::from_fn(|_| {
        Ok("Next engine: Extraction Engine\nInstruction: Read the price".into())
    })));
    let eng = engine_with(
        actor(),
        EngineConfig { settle_delay: Duration::ZERO, driver_timeout: Duration::from_millis(50), ..EngineConfig::default() },
    );
    let agent = Agent::new(catalog().with_stalled_restore(), world, eng, AgentConfig::default())
        .unwrap()
        .with_tree_search(search);

    let t = tokio::time::timeout(Duration::from_secs(5), agent.run("find the price", "https://shop.test"))
        .await
        .expect("run outlived its driver deadlines")
        .unwrap();

    assert_eq!(t.status, RunStatus::Failed);
    assert!(t.actions.is_empty());
    assert!(matches!(t.last_error, Some(AgentError::SearchExhausted { .. })));
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::driver::{within, Driver, PageState, SnapshotHandle};
use crate::engine::{engine_for, ActionEngine, ExecutionResult};
use crate::error::{AgentError, DriverError};
use crate::llm::{complete_within, LanguageModel};
use crate::world_model::{History, Instruction, WorldModel};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Lookahead depth explored before committing one action.
    pub max_depth: usize,
    /// Candidate actions sampled per expanded node.
    pub branching_factor: usize,
    /// Nodes kept at each depth level.
    pub sample_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { max_depth: 2, branching_factor: 3, sample_size: 2 }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_depth < 1 {
            return Err(AgentError::configuration("max_depth must be >= 1"));
        }
        if self.branching_factor < 1 {
            return Err(AgentError::configuration("branching_factor must be >= 1"));
        }
        if self.sample_size < 1 {
            return Err(AgentError::configuration("sample_size must be >= 1"));
        }
        Ok(())
    }
}

// ========================= Scoring =========================

/// Rates the state reached by a candidate action; higher is better.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, objective: &str, action: &Action, result: &ExecutionResult, page: &PageState) -> f64;
}

type ScoreFn = dyn Fn(&Action, &ExecutionResult, &PageState) -> f64 + Send + Sync;

/// Scorer backed by a plain closure.
pub struct FnScorer {
    f: Box<ScoreFn>,
}

impl FnScorer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Action, &ExecutionResult, &PageState) -> f64 + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Scorer for FnScorer {
    async fn score(&self, _objective: &str, action: &Action, result: &ExecutionResult, page: &PageState) -> f64 {
        (self.f)(action, result, page)
    }
}

static RATING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("rating regex"));

/// Asks the language model for a 0-10 progress rating.
pub struct LlmScorer {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl LlmScorer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm, timeout: Duration::from_secs(30) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_rating(answer: &str) -> Option<f64> {
        RATING_RE
            .find(answer)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|v| v.clamp(0.0, 10.0))
    }
}

#[async_trait]
impl Scorer for LlmScorer {
    async fn score(&self, objective: &str, action: &Action, result: &ExecutionResult, page: &PageState) -> f64 {
        let action_json = serde_json::to_string(action).unwrap_or_default();
        let prompt = format!(
            "Objective: {}\nAction taken: {}\nProduced text: {}\nResulting page: {} ({})\n\
             Rate from 0 to 10 how much closer this brings the agent to the objective. Answer with a number only.",
            objective,
            action_json,
            result.produced_text.as_deref().unwrap_or("[NONE]"),
            page.title.as_deref().unwrap_or(""),
            page.url,
        );
        match complete_within(self.llm.as_ref(), &prompt, self.timeout).await {
            Ok(answer) => Self::parse_rating(&answer).unwrap_or_else(|| {
                warn!(answer = %answer, "unreadable rating");
                0.0
            }),
            Err(e) => {
                warn!(error = %e, "scoring failed");
                0.0
            }
        }
    }
}

// ========================= Search Tree =========================

#[derive(Clone, Debug, Serialize)]
pub struct SearchNode {
    pub depth: usize,
    pub parent: Option<usize>,
    pub action: Action,
    pub result: ExecutionResult,
    #[serde(skip)]
    pub snapshot: Option<SnapshotHandle>,
    pub score: f64,
    pub cumulative: f64,
    /// Generation order across the whole tree.
    pub order: usize,
    pub retained: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchTree {
    pub nodes: Vec<SearchNode>,
}

impl SearchTree {
    /// Best retained node: highest cumulative score, then shallower, then
    /// generated first.
    pub fn best(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, n) in self.nodes.iter().enumerate().filter(|(_, n)| n.retained) {
            let better = match best {
                None => true,
                Some(b) => {
                    let cur = &self.nodes[b];
                    n.cumulative > cur.cumulative
                        || (n.cumulative == cur.cumulative
                            && (n.depth < cur.depth || (n.depth == cur.depth && n.order < cur.order)))
                }
            };
            if better {
                best = Some(i);
            }
        }
        best
    }

    /// Depth-1 ancestor of `idx`, i.e. the action that would be committed.
    pub fn first_step(&self, mut idx: usize) -> usize {
        while let Some(p) = self.nodes[idx].parent {
            idx = p;
        }
        idx
    }

    pub fn path(&self, mut idx: usize) -> Vec<usize> {
        let mut out = vec![idx];
        while let Some(p) = self.nodes[idx].parent {
            out.push(p);
            idx = p;
        }
        out.reverse();
        out
    }

    pub fn at_depth(&self, depth: usize) -> impl Iterator<Item = (usize, &SearchNode)> {
        self.nodes.iter().enumerate().filter(move |(_, n)| n.depth == depth)
    }
}

/// Outcome of one expanded step.
pub struct SearchOutcome {
    pub action: Action,
    pub result: ExecutionResult,
    pub tree: SearchTree,
    pub chosen: usize,
}

pub struct TreeSearch {
    cfg: SearchConfig,
    scorer: Arc<dyn Scorer>,
}

impl TreeSearch {
    pub fn new(cfg: SearchConfig, scorer: Arc<dyn Scorer>) -> Result<Self, AgentError> {
        cfg.validate()?;
        Ok(Self { cfg, scorer })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    /// Explores from the driver's current state and leaves the driver in the
    /// state reached by the committed action, which is re-run from the
    /// starting state. On error the driver is rewound to where it started.
    #[allow(clippy::too_many_arguments)]
    pub async fn expand(
        &self,
        step: usize,
        objective: &str,
        instruction: &Instruction,
        history: &History,
        world_model: &dyn WorldModel,
        engine: &ActionEngine,
        driver: &dyn Driver,
    ) -> Result<SearchOutcome, AgentError> {
        let deadline = engine.driver_timeout();
        let root = within(deadline, driver.snapshot()).await?;
        let mut tree = SearchTree::default();
        let grown = self
            .grow(&mut tree, &root, step, objective, instruction, history, world_model, engine, driver)
            .await;

        for node in tree.nodes.iter_mut() {
            if let Some(handle) = node.snapshot.take() {
                release(driver, &handle, deadline).await;
            }
        }

        let committed = match grown.and_then(|_| tree.best().ok_or(AgentError::SearchExhausted { step })) {
            Ok(best) => self.commit(&tree, best, &root, engine, driver).await.map(|c| (best, c)),
            Err(e) => Err(e),
        };
        if committed.is_err() {
            if let Err(e) = within(deadline, driver.restore(&root)).await {
                warn!(error = %e, "could not rewind to committed state");
            }
        }
        release(driver, &root, deadline).await;

        let (best, (first, action, result)) = committed?;
        info!(
            step,
            nodes = tree.nodes.len(),
            best_depth = tree.nodes[best].depth,
            best_score = tree.nodes[best].cumulative,
            committed = %action.step_id,
            "search step committed"
        );
        Ok(SearchOutcome { action, result, chosen: first, tree })
    }

    /// Rewinds to `root` and runs the depth-1 ancestor of `best` for real.
    async fn commit(
        &self,
        tree: &SearchTree,
        best: usize,
        root: &SnapshotHandle,
        engine: &ActionEngine,
        driver: &dyn Driver,
    ) -> Result<(usize, Action, ExecutionResult), AgentError> {
        let first = tree.first_step(best);
        within(engine.driver_timeout(), driver.restore(root)).await?;
        let (action, result) = engine.execute(driver, tree.nodes[first].action.clone()).await;
        if !result.success {
            let error = result.error.unwrap_or_else(|| DriverError::Other("committed action failed".into()));
            warn!(step_id = %action.step_id, error = %error, "committed action failed on replay");
            return Err(AgentError::Execution { error });
        }
        Ok((first, action, result))
    }

    #[allow(clippy::too_many_arguments)]
    async fn grow(
        &self,
        tree: &mut SearchTree,
        root: &SnapshotHandle,
        step: usize,
        objective: &str,
        instruction: &Instruction,
        history: &History,
        world_model: &dyn WorldModel,
        engine: &ActionEngine,
        driver: &dyn Driver,
    ) -> Result<(), AgentError> {
        let deadline = engine.driver_timeout();
        let mut frontier: Vec<Option<usize>> = vec![None];
        for depth in 1..=self.cfg.max_depth {
            let mut level: Vec<usize> = Vec::new();
            for parent in frontier.iter().copied() {
                let base = match parent {
                    Some(p) => match &tree.nodes[p].snapshot {
                        Some(h) => h.clone(),
                        None => continue,
                    },
                    None => root.clone(),
                };
                if let Err(e) = within(deadline, driver.restore(&base)).await {
                    warn!(depth, error = %e, "cannot restore node state, pruning");
                    continue;
                }
                let page = match within(deadline, driver.page_state()).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(depth, error = %e, "cannot read node state, pruning");
                        continue;
                    }
                };
                let node_instruction = match parent {
                    None => instruction.clone(),
                    Some(p) => {
                        let path_history = self.path_history(tree, p, history);
                        match world_model.propose_instruction(objective, &page, &path_history).await {
                            Ok(i) if i.is_complete() => continue,
                            Ok(i) => i,
                            Err(e) => {
                                debug!(depth, error = %e, "no instruction for lookahead node");
                                continue;
                            }
                        }
                    }
                };
                let candidates = match engine
                    .propose_candidates(&node_instruction, &page, self.cfg.branching_factor)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(depth, error = %e, "candidate generation failed");
                        continue;
                    }
                };

                let mut executed = Vec::new();
                for candidate in candidates {
                    if let Err(e) = within(deadline, driver.restore(&base)).await {
                        warn!(error = %e, "cannot restore before candidate");
                        break;
                    }
                    let (action, result) = engine.execute(driver, candidate).await;
                    if !result.success {
                        continue;
                    }
                    let after = match within(deadline, driver.page_state()).await {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    match within(deadline, driver.snapshot()).await {
                        Ok(handle) => executed.push((action, result, after, handle)),
                        Err(e) => warn!(error = %e, "cannot snapshot candidate state"),
                    }
                }

                let scores = join_all(
                    executed
                        .iter()
                        .map(|(a, r, p, _)| self.scorer.score(objective, a, r, p)),
                )
                .await;
                let parent_cumulative = parent.map(|p| tree.nodes[p].cumulative).unwrap_or(0.0);
                for ((action, result, _, handle), score) in executed.into_iter().zip(scores) {
                    let order = tree.nodes.len();
                    debug!(depth, order, score, kind = %action.kind, "candidate scored");
                    tree.nodes.push(SearchNode {
                        depth,
                        parent,
                        action,
                        result,
                        snapshot: Some(handle),
                        score,
                        cumulative: parent_cumulative + score,
                        order,
                        retained: true,
                    });
                    level.push(order);
                }
            }

            if level.is_empty() {
                if depth == 1 {
                    return Err(AgentError::SearchExhausted { step });
                }
                break;
            }

            level.sort_by(|a, b| {
                let (na, nb) = (&tree.nodes[*a], &tree.nodes[*b]);
                nb.cumulative
                    .partial_cmp(&na.cumulative)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(na.order.cmp(&nb.order))
            });
            for dropped in level.iter().skip(self.cfg.sample_size) {
                let node = &mut tree.nodes[*dropped];
                node.retained = false;
                if let Some(handle) = node.snapshot.take() {
                    release(driver, &handle, deadline).await;
                }
            }
            level.truncate(self.cfg.sample_size);
            frontier = level.into_iter().map(Some).collect();
        }
        Ok(())
    }

    fn path_history(&self, tree: &SearchTree, leaf: usize, history: &History) -> History {
        let mut h = history.clone();
        for idx in tree.path(leaf) {
            let node = &tree.nodes[idx];
            let ins = Instruction::new(engine_for(&node.action), node.action.instruction.clone());
            h.record(&ins, true, node.result.produced_text.as_deref());
        }
        h
    }
}

async fn release(driver: &dyn Driver, handle: &SnapshotHandle, deadline: Duration) {
    if tokio::time::timeout(deadline, driver.release(handle)).await.is_err() {
        warn!(handle = %handle.0, "snapshot release timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionRegistry, NavigationCommand};
    use crate::engine::EngineConfig;
    use crate::retriever::RetrieverPipeline;
    use crate::sim::{ScriptedModel, SimElement, SimPage, SimulatedDriver};
    use crate::world_model::{Engine, LlmWorldModel};

    fn node(depth: usize, parent: Option<usize>, cumulative: f64, order: usize) -> SearchNode {
        SearchNode {
            depth,
            parent,
            action: Action::navigation(NavigationCommand::Pass, "", None),
            result: ExecutionResult { success: true, produced_text: None, error: None },
            snapshot: None,
            score: 0.0,
            cumulative,
            order,
            retained: true,
        }
    }

    #[test]
    fn best_prefers_score_then_depth_then_order() {
        let tree = SearchTree {
            nodes: vec![
                node(1, None, 1.0, 0),
                node(1, None, 3.0, 1),
                node(2, Some(1), 3.0, 2),
                node(2, Some(0), 3.0, 3),
            ],
        };
        assert_eq!(tree.best(), Some(1));
        assert_eq!(tree.first_step(3), 0);
        assert_eq!(tree.path(2), vec![1, 2]);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        for cfg in [
            SearchConfig { max_depth: 0, ..SearchConfig::default() },
            SearchConfig { branching_factor: 0, ..SearchConfig::default() },
            SearchConfig { sample_size: 0, ..SearchConfig::default() },
        ] {
            assert!(matches!(cfg.validate(), Err(AgentError::Configuration { .. })));
        }
    }

    #[test]
    fn rating_is_clamped() {
        assert_eq!(LlmScorer::parse_rating("Score: 7"), Some(7.0));
        assert_eq!(LlmScorer::parse_rating("42"), Some(10.0));
        assert_eq!(LlmScorer::parse_rating("none"), None);
    }

    fn click(locator: &str) -> String {
        format!(
            r#"{{"kind": "web_navigation", "payload": {{"command": "click", "locator": "{}"}}}}"#,
            locator
        )
    }

    #[tokio::test]
    async fn all_failing_candidates_exhaust_the_step_and_rewind() {
        let driver = SimulatedDriver::new().with_page(
            SimPage::new("https://a.test", "A").element("//a[@id='ok']", SimElement::new("a", "ok").link_to("https://a.test/next")),
        );
        driver.navigate("https://a.test").await.unwrap();
        let engine = ActionEngine::new(
            Arc::new(ScriptedModel::new([click("//b[1]"), click("//b[2]"), click("//b[3]")])),
            Arc::new(RetrieverPipeline::default()),
            Arc::new(ActionRegistry::with_defaults()),
            EngineConfig { settle_delay: Duration::ZERO, ..EngineConfig::default() },
        );
        let wm = LlmWorldModel::new(Arc::new(ScriptedModel::new(Vec::<String>::new())));
        let search = TreeSearch::new(SearchConfig::default(), Arc::new(FnScorer::new(|_, _, _| 1.0))).unwrap();
        let ins = Instruction::new(Engine::Navigation, "click something");
        let res = search
            .expand(0, "obj", &ins, &History::default(), &wm, &engine, &driver)
            .await;
        assert!(matches!(res, Err(AgentError::SearchExhausted { step: 0 })));
        assert_eq!(driver.current_url().await.as_deref(), Some("https://a.test"));
        assert_eq!(driver.live_snapshots().await, 0);
    }
}

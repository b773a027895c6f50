use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionPayload, ActionRegistry, ActionStatus, ControlCommand};
use crate::driver::{within, Driver, PageState};
use crate::error::{AgentError, Attempt, DriverError, RetryBudget};
use crate::llm::{complete_within, LanguageModel};
use crate::retriever::{BoundedContext, Retriever};
use crate::world_model::{Engine, Instruction};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Model answers tried per proposal before giving up on malformed output.
    pub parse_attempts: usize,
    pub llm_timeout: Duration,
    pub driver_timeout: Duration,
    /// Pause after a state-changing command so the page can settle.
    pub settle_delay: Duration,
    /// Ask the model for a retrieval query instead of using the instruction verbatim.
    pub rephrase_queries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parse_attempts: 3,
            llm_timeout: Duration::from_secs(60),
            driver_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(500),
            rephrase_queries: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub produced_text: Option<String>,
    pub error: Option<DriverError>,
}

impl ExecutionResult {
    fn ok(produced_text: Option<String>) -> Self {
        Self { success: true, produced_text, error: None }
    }

    fn failed(error: DriverError) -> Self {
        Self { success: false, produced_text: None, error: Some(error) }
    }
}

/// Turns instructions into validated actions and runs them on a driver.
pub struct ActionEngine {
    llm: Arc<dyn LanguageModel>,
    retriever: Arc<dyn Retriever>,
    registry: Arc<ActionRegistry>,
    cfg: EngineConfig,
}

impl ActionEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        retriever: Arc<dyn Retriever>,
        registry: Arc<ActionRegistry>,
        cfg: EngineConfig,
    ) -> Self {
        Self { llm, retriever, registry, cfg }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    async fn retrieval_query(&self, instruction: &str) -> String {
        if !self.cfg.rephrase_queries {
            return instruction.to_string();
        }
        let prompt = format!(
            "Rewrite the web instruction as a search query over the page HTML. \
             Keep element names and quoted texts, drop the action itself.\n\
             Text instruction: {}\nSearch query:",
            instruction
        );
        match complete_within(self.llm.as_ref(), &prompt, self.cfg.llm_timeout).await {
            Ok(q) => {
                let q = q.replace("Search query:", "").trim().to_string();
                if q.is_empty() { instruction.to_string() } else { q }
            }
            Err(e) => {
                warn!(error = %e, "query rephrase failed, using instruction");
                instruction.to_string()
            }
        }
    }

    fn build_prompt(
        &self,
        instruction: &Instruction,
        context: &BoundedContext,
        candidate: Option<(usize, usize)>,
        feedback: Option<&str>,
    ) -> String {
        let mut s = String::new();
        s.push_str("You translate a web instruction into exactly one action.\n");
        s.push_str("Answer with a ```json block: {\"kind\": <kind>, \"payload\": {...}}.\n");
        s.push_str("Known kinds:\n");
        s.push_str(&self.registry.describe());
        s.push_str("\nNavigation commands: click, hover, set_value, set_value_and_enter, type_key, scroll, switch_tab, back, pass.\n");
        s.push_str("Control commands: scroll_up, scroll_down, wait, back, switch_tab.\n");
        s.push_str("Locators are XPath expressions taken from the `xpath` attributes below.\n\n");
        s.push_str("HTML:\n");
        s.push_str(&context.render());
        s.push_str("\n\nEngine: ");
        s.push_str(instruction.engine.label());
        s.push_str("\nQuery: ");
        s.push_str(&instruction.text);
        if let Some((i, n)) = candidate {
            s.push_str(&format!("\nThis is candidate {} of {}; prefer an option different from the obvious one when several are plausible.", i + 1, n));
        }
        if let Some(fb) = feedback {
            s.push_str("\nYour previous answer was rejected: ");
            s.push_str(fb);
        }
        s.push_str("\nCompletion:\n");
        s
    }

    fn stamp(&self, mut action: Action, instruction: &Instruction, page: &PageState) -> Action {
        action.instruction = instruction.text.clone();
        action.url = page.url.clone();
        action.status = ActionStatus::Proposed;
        action
    }

    /// Proposes one action, re-prompting with the parse failure on malformed output.
    pub async fn propose_action(&self, instruction: &Instruction, page: &PageState) -> Result<Action, AgentError> {
        let query = self.retrieval_query(&instruction.text).await;
        let context = self.retriever.retrieve(&query, page).await?;
        let mut budget = RetryBudget::new(self.cfg.parse_attempts.max(1));
        let mut feedback: Option<String> = None;
        loop {
            let prompt = self.build_prompt(instruction, &context, None, feedback.as_deref());
            let attempt = match complete_within(self.llm.as_ref(), &prompt, self.cfg.llm_timeout).await {
                Ok(raw) => self.registry.parse(&raw),
                Err(e) => Err(e.into()),
            };
            match budget.record(Attempt::from(attempt)) {
                Ok(action) => return Ok(self.stamp(action, instruction, page)),
                Err(Some(e)) => return Err(e),
                Err(None) => {
                    let last = budget.last_error().map(|e| e.to_string()).unwrap_or_default();
                    warn!(attempt = budget.used(), error = %last, "action proposal rejected, re-prompting");
                    feedback = Some(last);
                }
            }
        }
    }

    /// Samples `n` independent proposals. Malformed samples are dropped.
    pub async fn propose_candidates(
        &self,
        instruction: &Instruction,
        page: &PageState,
        n: usize,
    ) -> Result<Vec<Action>, AgentError> {
        let query = self.retrieval_query(&instruction.text).await;
        let context = self.retriever.retrieve(&query, page).await?;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let prompt = self.build_prompt(instruction, &context, Some((i, n)), None);
            let parsed = match complete_within(self.llm.as_ref(), &prompt, self.cfg.llm_timeout).await {
                Ok(raw) => self.registry.parse(&raw),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(action) => out.push(self.stamp(action, instruction, page)),
                Err(e) => warn!(candidate = i, error = %e, "candidate dropped"),
            }
        }
        Ok(out)
    }

    /// Deadline applied to every driver call made on behalf of this engine.
    pub fn driver_timeout(&self) -> Duration {
        self.cfg.driver_timeout
    }

    async fn settle(&self) {
        if !self.cfg.settle_delay.is_zero() {
            tokio::time::sleep(self.cfg.settle_delay).await;
        }
    }

    async fn run(&self, driver: &dyn Driver, action: &mut Action) -> Result<Option<String>, DriverError> {
        match &mut action.payload {
            ActionPayload::Navigation(p) => {
                if p.command.is_noop() {
                    return Ok(None);
                }
                if p.command.needs_locator() {
                    within(self.cfg.driver_timeout, driver.find(&p.locator)).await?;
                }
                within(self.cfg.driver_timeout, driver.interact(p.command, &p.locator, p.value.as_deref())).await?;
                self.settle().await;
                Ok(None)
            }
            ActionPayload::Extraction(p) => {
                let node = within(self.cfg.driver_timeout, driver.find(&p.locator)).await?;
                p.text = node.text.clone();
                p.outer_html = node.outer_html;
                Ok(Some(node.text))
            }
            ActionPayload::Control(p) => {
                within(self.cfg.driver_timeout, driver.control(p.command, p.value.as_deref())).await?;
                if p.command != ControlCommand::Wait {
                    self.settle().await;
                }
                Ok(None)
            }
        }
    }

    /// Runs `action` on `driver`. Driver failures are reported in the result,
    /// never returned as errors.
    pub async fn execute(&self, driver: &dyn Driver, mut action: Action) -> (Action, ExecutionResult) {
        let result = match self.run(driver, &mut action).await {
            Ok(text) => {
                action.status = ActionStatus::Executed;
                ExecutionResult::ok(text)
            }
            Err(e) => {
                action.status = ActionStatus::Failed;
                ExecutionResult::failed(e)
            }
        };
        if result.success {
            info!(kind = %action.kind, step_id = %action.step_id, "action executed");
        } else {
            debug!(kind = %action.kind, error = ?result.error, "action failed");
        }
        (action, result)
    }
}

/// Engine the world model expects a given action kind to come from.
pub fn engine_for(action: &Action) -> Engine {
    match action.payload {
        ActionPayload::Navigation(_) => Engine::Navigation,
        ActionPayload::Extraction(_) => Engine::Extraction,
        ActionPayload::Control(_) => Engine::Controls,
    }
}

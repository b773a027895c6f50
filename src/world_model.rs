use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::PageState;
use crate::error::AgentError;
use crate::llm::{complete_within, LanguageModel};
use crate::retriever::Retriever;

/// Which part of the action engine the next instruction is meant for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Navigation,
    Extraction,
    Controls,
    Complete,
}

impl Engine {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Navigation => "Navigation Engine",
            Self::Extraction => "Extraction Engine",
            Self::Controls => "Navigation Controls",
            Self::Complete => "COMPLETE",
        }
    }

    /// Matches the free-text engine name a model wrote.
    pub fn from_text(text: &str) -> Option<Self> {
        let t = text.to_lowercase();
        if t.contains("complete") || t.contains("success") {
            Some(Self::Complete)
        } else if t.contains("control") {
            Some(Self::Controls)
        } else if t.contains("navigation") {
            Some(Self::Navigation)
        } else if t.contains("extract") || t.contains("python") {
            Some(Self::Extraction)
        } else {
            None
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub engine: Engine,
    pub text: String,
    pub thoughts: String,
}

impl Instruction {
    pub fn new(engine: Engine, text: impl Into<String>) -> Self {
        Self { engine, text: text.into(), thoughts: String::new() }
    }

    pub fn is_complete(&self) -> bool {
        self.engine == Engine::Complete
    }
}

// ========================= History =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub instruction: String,
    pub engine: Engine,
    pub success: bool,
}

/// What the agent already tried this run, fed back to the planner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub entries: Vec<HistoryEntry>,
    pub outputs: Vec<String>,
}

impl History {
    pub fn record(&mut self, instruction: &Instruction, success: bool, output: Option<&str>) {
        self.entries.push(HistoryEntry {
            instruction: instruction.text.clone(),
            engine: instruction.engine,
            success,
        });
        if let Some(out) = output.filter(|o| !o.trim().is_empty()) {
            self.outputs.push(out.to_string());
        }
    }

    pub fn last_engine(&self) -> Option<Engine> {
        self.entries.last().map(|e| e.engine)
    }

    pub fn render_instructions(&self) -> String {
        if self.entries.is_empty() {
            return "[NONE]".to_string();
        }
        self.entries
            .iter()
            .map(|e| {
                if e.success {
                    format!("- {}", e.instruction)
                } else {
                    format!("- [FAILED] {}", e.instruction)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait WorldModel: Send + Sync {
    async fn propose_instruction(
        &self,
        objective: &str,
        page: &PageState,
        history: &History,
    ) -> Result<Instruction, AgentError>;
}

// ========================= LLM-backed World Model =========================

pub struct LlmWorldModel {
    llm: Arc<dyn LanguageModel>,
    retriever: Option<Arc<dyn Retriever>>,
    timeout: Duration,
}

impl LlmWorldModel {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm, retriever: None, timeout: Duration::from_secs(60) }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn build_prompt(&self, objective: &str, page: &PageState, history: &History) -> Result<String, AgentError> {
        let view = match &self.retriever {
            Some(r) => r.retrieve(objective, page).await?.render(),
            None => String::new(),
        };
        let outputs = if history.outputs.is_empty() {
            "[NONE]".to_string()
        } else {
            history.outputs.join("\n")
        };
        Ok(format!(
            "You plan the next step of a web agent.\n\
             Answer with three sections:\n\
             Thoughts: <reasoning>\n\
             Next engine: <Navigation Engine | Extraction Engine | Navigation Controls | COMPLETE>\n\
             Instruction: <one concrete step, or the final answer when COMPLETE>\n\n\
             Objective: {objective}\n\
             Current url: {url}\n\
             Open tabs: {tabs} (switch_tab takes a 0-based index)\n\
             Page:\n{view}\n\n\
             Previous instructions:\n{previous}\n\
             Last engine: {last}\n\
             Outputs so far:\n{outputs}\n",
            objective = objective,
            url = page.url,
            tabs = page.tab_count.max(1),
            view = view,
            previous = history.render_instructions(),
            last = history.last_engine().map(|e| e.label()).unwrap_or("[NONE]"),
            outputs = outputs,
        ))
    }
}

#[async_trait]
impl WorldModel for LlmWorldModel {
    async fn propose_instruction(
        &self,
        objective: &str,
        page: &PageState,
        history: &History,
    ) -> Result<Instruction, AgentError> {
        let prompt = self.build_prompt(objective, page, history).await?;
        let answer = complete_within(self.llm.as_ref(), &prompt, self.timeout)
            .await
            .map_err(|e| AgentError::planning(e.to_string()))?;
        debug!(answer = %answer, "world model answer");
        parse_instruction(&answer)
    }
}

fn section_re(header: &str) -> Regex {
    let pattern = format!(
        r"(?ims)^\s*(?:###\s*)?{}:\s*(.*?)(?:^\s*(?:###\s*)?(?:thoughts|next engine|instruction):|\z)",
        header
    );
    Regex::new(&pattern).expect("section regex")
}

static THOUGHTS_RE: Lazy<Regex> = Lazy::new(|| section_re("thoughts"));
static ENGINE_RE: Lazy<Regex> = Lazy::new(|| section_re("next engine"));
static INSTRUCTION_RE: Lazy<Regex> = Lazy::new(|| section_re("instruction"));
static LIST_MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:-\s+|\d+\.\s+)").expect("list marker regex"));

fn section(text: &str, re: &Regex) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn clean_instruction(raw: &str) -> String {
    let body = raw.trim().trim_start_matches("```").trim_end_matches("```");
    body.lines()
        .map(|l| LIST_MARKER_RE.replace(l.trim(), "").into_owned())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the `Next engine:` / `Instruction:` answer format.
pub fn parse_instruction(answer: &str) -> Result<Instruction, AgentError> {
    let engine_text = section(answer, &ENGINE_RE)
        .ok_or_else(|| AgentError::planning("answer has no `Next engine:` section"))?;
    let first_line = engine_text.lines().next().unwrap_or_default();
    let engine = Engine::from_text(first_line)
        .ok_or_else(|| AgentError::planning(format!("unknown engine `{}`", first_line)))?;
    let text = section(answer, &INSTRUCTION_RE).map(|s| clean_instruction(&s)).unwrap_or_default();
    if text.is_empty() && engine != Engine::Complete {
        return Err(AgentError::planning("empty instruction"));
    }
    let thoughts = section(answer, &THOUGHTS_RE).unwrap_or_default();
    Ok(Instruction { engine, text, thoughts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::sim::ScriptedModel;

    #[test]
    fn parses_the_three_sections() {
        let answer = "Thoughts:\n- The search bar is visible.\nNext engine: Navigation Engine\nInstruction: Click on the search bar and type 'candle', then press Enter";
        let ins = parse_instruction(answer).unwrap();
        assert_eq!(ins.engine, Engine::Navigation);
        assert_eq!(ins.text, "Click on the search bar and type 'candle', then press Enter");
        assert_eq!(ins.thoughts, "- The search bar is visible.");
    }

    #[test]
    fn joins_multiline_instructions() {
        let answer = "### Next Engine: Navigation Controls\n### Instruction:\n- Scroll down\n- Wait 2 seconds";
        let ins = parse_instruction(answer).unwrap();
        assert_eq!(ins.engine, Engine::Controls);
        assert_eq!(ins.text, "Scroll down Wait 2 seconds");
    }

    #[test]
    fn complete_may_carry_the_answer() {
        let ins = parse_instruction("Next engine: COMPLETE\nInstruction: The cheapest candle costs 4 EUR").unwrap();
        assert!(ins.is_complete());
        assert_eq!(ins.text, "The cheapest candle costs 4 EUR");
        assert!(parse_instruction("Next engine: SUCCESS").unwrap().is_complete());
    }

    #[test]
    fn empty_or_unknown_is_a_planning_error() {
        assert!(matches!(
            parse_instruction("Next engine: Navigation Engine\nInstruction:   "),
            Err(AgentError::Planning { .. })
        ));
        assert!(matches!(parse_instruction(""), Err(AgentError::Planning { .. })));
        assert!(matches!(
            parse_instruction("Next engine: Teleporter\nInstruction: go"),
            Err(AgentError::Planning { .. })
        ));
    }

    #[test]
    fn history_marks_failures() {
        let mut h = History::default();
        assert_eq!(h.render_instructions(), "[NONE]");
        h.record(&Instruction::new(Engine::Navigation, "Click login"), false, None);
        h.record(&Instruction::new(Engine::Extraction, "Read price"), true, Some("4 EUR"));
        assert_eq!(h.render_instructions(), "- [FAILED] Click login\n- Read price");
        assert_eq!(h.outputs, vec!["4 EUR".to_string()]);
        assert_eq!(h.last_engine(), Some(Engine::Extraction));
    }

    #[tokio::test]
    async fn prompt_carries_objective_and_history() {
        let model = ScriptedModel::new(["Next engine: COMPLETE\nInstruction: done"]);
        let wm = LlmWorldModel::new(Arc::new(model.clone()));
        let mut h = History::default();
        h.record(&Instruction::new(Engine::Navigation, "Open cart"), false, None);
        let page = PageState { url: "https://shop.test".into(), tab_count: 3, ..Default::default() };
        let ins = wm.propose_instruction("buy a candle", &page, &h).await.unwrap();
        assert!(ins.is_complete());
        let prompts = model.prompts().await;
        assert!(prompts[0].contains("Objective: buy a candle"));
        assert!(prompts[0].contains("Open tabs: 3"));
        assert!(prompts[0].contains("- [FAILED] Open cart"));
        assert!(prompts[0].contains("https://shop.test"));
    }

    #[tokio::test]
    async fn llm_failure_is_a_planning_error() {
        let model = ScriptedModel::new(Vec::<String>::new());
        model.push_error(LlmError::Status { status: 503, body: "overloaded".into() }).await;
        let wm = LlmWorldModel::new(Arc::new(model));
        let err = wm
            .propose_instruction("x", &PageState::default(), &History::default())
            .await
            .unwrap_err();
        match err {
            AgentError::Planning { message } => assert!(message.contains("503")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}

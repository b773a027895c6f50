use std::collections::BTreeMap;
use std::fmt;

use nanoid::nanoid;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

pub const NAVIGATION: &str = "web_navigation";
pub const EXTRACTION: &str = "web_extraction";
pub const CONTROL: &str = "web_control";

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Proposed,
    Executed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationCommand {
    Click,
    Hover,
    SetValue,
    SetValueAndEnter,
    TypeKey,
    Scroll,
    SwitchTab,
    Back,
    Pass,
}

impl NavigationCommand {
    /// Commands that leave the page untouched.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Commands that target an element. Scroll acts on the window.
    pub fn needs_locator(&self) -> bool {
        !matches!(self, Self::Pass | Self::Back | Self::SwitchTab | Self::Scroll)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    ScrollUp,
    ScrollDown,
    Wait,
    Back,
    SwitchTab,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationPayload {
    pub command: NavigationCommand,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub locator: String,
    pub description: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub outer_html: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub command: ControlCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Structured body of an action. Which variant is legal is decided by the
/// action's `kind` through the registry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionPayload {
    Navigation(NavigationPayload),
    Extraction(ExtractionPayload),
    Control(ControlPayload),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Action {
    pub step_id: String,
    pub kind: String,
    pub status: ActionStatus,
    pub instruction: String,
    pub url: String,
    pub payload: ActionPayload,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: ActionPayload) -> Self {
        Self {
            step_id: nanoid!(),
            kind: kind.into(),
            status: ActionStatus::Proposed,
            instruction: String::new(),
            url: String::new(),
            payload,
        }
    }

    pub fn navigation(command: NavigationCommand, locator: impl Into<String>, value: Option<String>) -> Self {
        Self::new(
            NAVIGATION,
            ActionPayload::Navigation(NavigationPayload { command, locator: locator.into(), value }),
        )
    }

    pub fn extraction(locator: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(
            EXTRACTION,
            ActionPayload::Extraction(ExtractionPayload {
                locator: locator.into(),
                description: description.into(),
                text: String::new(),
                outer_html: String::new(),
            }),
        )
    }

    pub fn control(command: ControlCommand, value: Option<String>) -> Self {
        Self::new(CONTROL, ActionPayload::Control(ControlPayload { command, value }))
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Text produced by an extraction, if any.
    pub fn extracted_text(&self) -> Option<&str> {
        match &self.payload {
            ActionPayload::Extraction(p) if !p.text.trim().is_empty() => Some(p.text.as_str()),
            _ => None,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(&self.payload, ActionPayload::Navigation(p) if p.command.is_noop())
    }
}

// ========================= Registry =========================

type Decoder = fn(Value) -> Result<ActionPayload, serde_json::Error>;

/// Payload schema bound to an action kind: the fields that must be present and
/// the constructor that turns a validated JSON object into a payload.
#[derive(Clone)]
pub struct ActionSchema {
    pub payload: &'static str,
    pub required: &'static [&'static str],
    decode: Decoder,
}

impl ActionSchema {
    pub fn new(payload: &'static str, required: &'static [&'static str], decode: Decoder) -> Self {
        Self { payload, required, decode }
    }

    pub fn navigation() -> Self {
        Self::new("navigation", &["command", "locator"], |v| {
            serde_json::from_value(v).map(ActionPayload::Navigation)
        })
    }

    pub fn extraction() -> Self {
        Self::new("extraction", &["locator", "description"], |v| {
            serde_json::from_value(v).map(ActionPayload::Extraction)
        })
    }

    pub fn control() -> Self {
        Self::new("control", &["command"], |v| serde_json::from_value(v).map(ActionPayload::Control))
    }

    fn validate(&self, payload: &Value) -> Result<(), String> {
        let obj = payload
            .as_object()
            .ok_or_else(|| "payload is not an object".to_string())?;
        for field in self.required {
            match obj.get(*field) {
                None | Some(Value::Null) => return Err(format!("missing required field `{}`", field)),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl PartialEq for ActionSchema {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload && self.required == other.required
    }
}

impl fmt::Debug for ActionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSchema")
            .field("payload", &self.payload)
            .field("required", &self.required)
            .finish()
    }
}

/// Maps action kinds to payload schemas. Built once at startup and shared
/// read-only (usually behind an `Arc`) for the rest of the process.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    schemas: BTreeMap<String, ActionSchema>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // fresh registry, the built-in kinds cannot conflict
        for (kind, schema) in [
            (NAVIGATION, ActionSchema::navigation()),
            (EXTRACTION, ActionSchema::extraction()),
            (CONTROL, ActionSchema::control()),
        ] {
            registry.schemas.insert(kind.to_string(), schema);
        }
        registry
    }

    pub fn register(&mut self, kind: &str, schema: ActionSchema) -> Result<(), AgentError> {
        if kind.trim().is_empty() {
            return Err(AgentError::configuration("action kind must not be empty"));
        }
        match self.schemas.get(kind) {
            Some(existing) if *existing == schema => Ok(()),
            Some(existing) => Err(AgentError::configuration(format!(
                "action kind `{}` already registered with schema {:?}",
                kind, existing.payload
            ))),
            None => {
                self.schemas.insert(kind.to_string(), schema);
                Ok(())
            }
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(|k| k.as_str())
    }

    pub fn schema(&self, kind: &str) -> Option<&ActionSchema> {
        self.schemas.get(kind)
    }

    /// Parses free-text model output into a validated action.
    pub fn parse(&self, raw: &str) -> Result<Action, AgentError> {
        let doc = extract_document(raw).ok_or_else(|| AgentError::malformed(raw, "no structured action found"))?;
        self.decode_value(doc).map_err(|e| match e {
            AgentError::MalformedAction { reason, .. } => AgentError::malformed(raw, reason),
            other => other,
        })
    }

    /// Validates an already structured action document.
    pub fn decode_value(&self, doc: Value) -> Result<Action, AgentError> {
        let raw = doc.to_string();
        let obj = doc
            .as_object()
            .ok_or_else(|| AgentError::malformed(&raw, "action is not an object"))?;
        let kind = obj
            .get("kind")
            .or_else(|| obj.get("action_type"))
            .and_then(|k| k.as_str())
            .ok_or_else(|| AgentError::malformed(&raw, "missing `kind` tag"))?;
        let schema = self
            .schemas
            .get(kind)
            .ok_or_else(|| AgentError::malformed(&raw, format!("unregistered action kind `{}`", kind)))?;
        let payload = obj
            .get("payload")
            .cloned()
            .ok_or_else(|| AgentError::malformed(&raw, "missing `payload`"))?;
        schema.validate(&payload).map_err(|reason| AgentError::malformed(&raw, reason))?;
        let payload = (schema.decode)(payload).map_err(|e| AgentError::malformed(&raw, e.to_string()))?;

        let status = match obj.get("status") {
            None | Some(Value::Null) => ActionStatus::Proposed,
            Some(s) => serde_json::from_value(s.clone())
                .map_err(|e| AgentError::malformed(&raw, format!("bad status: {}", e)))?,
        };
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());

        Ok(Action {
            step_id: text("step_id").unwrap_or_else(|| nanoid!()),
            kind: kind.to_string(),
            status,
            instruction: text("instruction").unwrap_or_default(),
            url: text("url").unwrap_or_default(),
            payload,
        })
    }

    /// One line per kind, for prompts.
    pub fn describe(&self) -> String {
        self.schemas
            .iter()
            .map(|(kind, schema)| format!("- {}: payload fields {}", kind, schema.required.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(json|yaml|yml)?\s*\n?(.*?)```").expect("fence regex"));

/// Finds the structured part of a model answer. Fenced blocks come first, then
/// every balanced `{...}` in reading order; the first object carrying a kind
/// tag wins. Untagged objects are kept as a fallback so validation can say
/// what is missing, and the whole text is tried as YAML last.
fn extract_document(raw: &str) -> Option<Value> {
    let mut untagged = None;
    for doc in fenced_documents(raw).chain(json_objects(raw)) {
        if has_kind_tag(&doc) {
            return Some(doc);
        }
        if untagged.is_none() && doc.is_object() {
            untagged = Some(doc);
        }
    }
    if untagged.is_some() {
        return untagged;
    }
    match serde_yaml::from_str::<Value>(raw.trim()) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

fn has_kind_tag(doc: &Value) -> bool {
    doc.get("kind").or_else(|| doc.get("action_type")).map(Value::is_string).unwrap_or(false)
}

fn fenced_documents(raw: &str) -> impl Iterator<Item = Value> + '_ {
    FENCE_RE.captures_iter(raw).filter_map(|caps| {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();
        match lang {
            "yaml" | "yml" => serde_yaml::from_str(body).ok(),
            _ => serde_json::from_str(body).ok().or_else(|| serde_yaml::from_str(body).ok()),
        }
    })
}

fn json_objects(raw: &str) -> impl Iterator<Item = Value> + '_ {
    raw.char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(move |(start, _)| balanced_object(&raw[start..]))
}

/// Parses the balanced object at the start of `text`, which begins with `{`.
fn balanced_object(text: &str) -> Option<Value> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_str {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return serde_json::from_str(&text[..i + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

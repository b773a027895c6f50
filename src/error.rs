use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trajectory::RunStatus;

/// Failures reported by a [`crate::driver::Driver`]. These are values, never panics:
/// the action engine folds them into an `ExecutionResult`.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DriverError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("driver timeout: {0}")]
    Timeout(String),
    #[error("no page loaded")]
    NoPage,
    #[error("history root reached, cannot go back")]
    CannotGoBack,
    #[error("unknown snapshot handle: {0}")]
    UnknownSnapshot(String),
    #[error("driver error: {0}")]
    Other(String),
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("llm call timed out after {0} ms")]
    Timeout(u64),
    #[error("llm script exhausted")]
    Exhausted,
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentError {
    #[error("malformed action ({reason}): {raw}")]
    MalformedAction { raw: String, reason: String },
    #[error("planning error: {message}")]
    Planning { message: String },
    #[error("execution error: {error}")]
    Execution { error: DriverError },
    #[error("search exhausted at step {step}: every candidate was pruned")]
    SearchExhausted { step: usize },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("language model error: {error}")]
    Llm { error: LlmError },
    #[error("invalid trajectory transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("timeout: {message}")]
    Timeout { message: String },
    #[error("io error: {message}")]
    Io { message: String },
    #[error("run cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn malformed(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedAction { raw: raw.into(), reason: reason.into() }
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    /// Short machine-readable name of the error kind, stored on trajectories.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedAction { .. } => "malformed_action",
            Self::Planning { .. } => "planning",
            Self::Execution { .. } => "execution",
            Self::SearchExhausted { .. } => "search_exhausted",
            Self::Configuration { .. } => "configuration",
            Self::Llm { .. } => "llm",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a fresh attempt inside the current step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MalformedAction { .. }
                | Self::Planning { .. }
                | Self::Execution { .. }
                | Self::Llm { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<DriverError> for AgentError {
    fn from(error: DriverError) -> Self {
        Self::Execution { error }
    }
}

impl From<LlmError> for AgentError {
    fn from(error: LlmError) -> Self {
        Self::Llm { error }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io { message: format!("json: {}", e) }
    }
}

// ========================= Bounded retries =========================

/// Outcome of one attempt inside a bounded retry loop.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(AgentError),
    Fatal(AgentError),
}

impl<T> From<Result<T, AgentError>> for Attempt<T> {
    fn from(res: Result<T, AgentError>) -> Self {
        match res {
            Ok(v) => Attempt::Success(v),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Counts attempts against a fixed limit and remembers the last failure.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: usize,
    used: usize,
    last_error: Option<AgentError>,
}

impl RetryBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0, last_error: None }
    }

    pub fn has_remaining(&self) -> bool {
        self.used < self.limit
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn last_error(&self) -> Option<&AgentError> {
        self.last_error.as_ref()
    }

    /// Records an attempt. Returns `Ok(value)` on success, `Err(None)` when the
    /// caller may try again, and `Err(Some(err))` when it must give up.
    pub fn record<T>(&mut self, attempt: Attempt<T>) -> Result<T, Option<AgentError>> {
        self.used += 1;
        match attempt {
            Attempt::Success(v) => Ok(v),
            Attempt::Fatal(e) => {
                self.last_error = Some(e.clone());
                Err(Some(e))
            }
            Attempt::Retryable(e) => {
                self.last_error = Some(e.clone());
                if self.has_remaining() {
                    Err(None)
                } else {
                    Err(Some(e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_gives_up_after_limit() {
        let mut budget = RetryBudget::new(2);
        let first: Result<(), _> = budget.record(Attempt::Retryable(AgentError::planning("empty")));
        assert_eq!(first, Err(None));
        let second: Result<(), _> = budget.record(Attempt::Retryable(AgentError::planning("empty")));
        assert!(matches!(second, Err(Some(AgentError::Planning { .. }))));
        assert!(!budget.has_remaining());
    }

    #[test]
    fn fatal_stops_immediately() {
        let mut budget = RetryBudget::new(5);
        let res: Result<(), _> = budget.record(Attempt::Fatal(AgentError::Cancelled));
        assert_eq!(res, Err(Some(AgentError::Cancelled)));
        assert_eq!(budget.used(), 1);
    }

    #[test]
    fn classification_follows_kind() {
        let a: Attempt<()> = Err(AgentError::malformed("x", "bad")).into();
        assert!(matches!(a, Attempt::Retryable(_)));
        let b: Attempt<()> = Err(AgentError::configuration("depth")).into();
        assert!(matches!(b, Attempt::Fatal(_)));
    }

    #[test]
    fn errors_serialize_with_kind_tag() {
        let err = AgentError::Execution { error: DriverError::NotFound("//a".into()) };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "execution");
        let back: AgentError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }
}

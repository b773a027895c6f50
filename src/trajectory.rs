use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs as async_fs;

use crate::action::{Action, ActionRegistry};
use crate::error::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled | Self::TimedOut)
    }

    /// Edges of the run state machine. Terminal states are absorbing.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running) => true,
            (Self::Starting | Self::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

/// Ordered record of the actions committed during one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Trajectory {
    pub run_id: String,
    pub start_url: String,
    pub objective: String,
    pub viewport_size: (u32, u32),
    pub status: RunStatus,
    pub actions: Vec<Action>,
    pub last_instruction: Option<String>,
    pub last_error: Option<AgentError>,
    pub output: Option<String>,
}

impl Trajectory {
    pub fn new(
        run_id: impl Into<String>,
        start_url: impl Into<String>,
        objective: impl Into<String>,
        viewport_size: (u32, u32),
    ) -> Self {
        Self {
            run_id: run_id.into(),
            start_url: start_url.into(),
            objective: objective.into(),
            viewport_size,
            status: RunStatus::Starting,
            actions: Vec::new(),
            last_instruction: None,
            last_error: None,
            output: None,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), AgentError> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// Appends a committed action. The first commit moves the run to `running`.
    pub fn commit(&mut self, action: Action) -> Result<(), AgentError> {
        match self.status {
            RunStatus::Starting => self.transition(RunStatus::Running)?,
            RunStatus::Running => {}
            terminal => return Err(AgentError::InvalidTransition { from: terminal, to: RunStatus::Running }),
        }
        self.actions.push(action);
        Ok(())
    }

    pub fn note_instruction(&mut self, instruction: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.last_instruction = Some(instruction.to_string());
        Ok(())
    }

    pub fn note_error(&mut self, error: AgentError) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Moves the run to a terminal status. The trajectory is frozen afterwards.
    pub fn finish(&mut self, status: RunStatus, output: Option<String>) -> Result<(), AgentError> {
        if !status.is_terminal() {
            return Err(AgentError::InvalidTransition { from: self.status, to: status });
        }
        self.transition(status)?;
        if output.is_some() {
            self.output = output;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.status.is_terminal() {
            return Err(AgentError::InvalidTransition { from: self.status, to: self.status });
        }
        Ok(())
    }

    // ========================= Persistence =========================

    pub fn to_json(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a trajectory back, decoding every action through `registry`.
    pub fn from_json(data: &str, registry: &ActionRegistry) -> Result<Self, AgentError> {
        let mut v: Value = serde_json::from_str(data)?;
        let raw_actions = match v.get_mut("actions").map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(AgentError::io("trajectory `actions` is not a list")),
        };
        let actions = raw_actions
            .into_iter()
            .map(|a| registry.decode_value(a))
            .collect::<Result<Vec<_>, _>>()?;
        let header: TrajectoryHeader = serde_json::from_value(v)?;
        Ok(Self {
            run_id: header.run_id,
            start_url: header.start_url,
            objective: header.objective,
            viewport_size: header.viewport_size,
            status: header.status,
            actions,
            last_instruction: header.last_instruction,
            last_error: header.last_error,
            output: header.output,
        })
    }

    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        async_fs::write(path.as_ref(), self.to_json()?).await?;
        Ok(())
    }

    pub async fn from_file(path: impl AsRef<Path>, registry: &ActionRegistry) -> Result<Self, AgentError> {
        let data = async_fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&data, registry)
    }
}

#[derive(Deserialize)]
struct TrajectoryHeader {
    run_id: String,
    start_url: String,
    objective: String,
    viewport_size: (u32, u32),
    status: RunStatus,
    #[serde(default)]
    last_instruction: Option<String>,
    #[serde(default)]
    last_error: Option<AgentError>,
    #[serde(default)]
    output: Option<String>,
}

// ========================= Stores =========================

/// Sink notified as a run progresses.
#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    async fn write_run_start(&self, trajectory: &Trajectory) -> Result<(), AgentError>;
    async fn write_action(
        &self,
        trajectory: &Trajectory,
        action: &Action,
        screenshot_b64: Option<&str>,
    ) -> Result<(), AgentError>;
    async fn write_run_end(&self, trajectory: &Trajectory) -> Result<(), AgentError>;
}

pub struct NullTrajectoryStore;

#[async_trait]
impl TrajectoryStore for NullTrajectoryStore {
    async fn write_run_start(&self, _trajectory: &Trajectory) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_action(&self, _trajectory: &Trajectory, _action: &Action, _shot: Option<&str>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_run_end(&self, _trajectory: &Trajectory) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Writes `<base>/<run_id>/trajectory.json` after every change, plus one PNG
/// per committed step when the driver captured a screenshot.
pub struct DiskTrajectoryStore {
    base_dir: PathBuf,
}

impl DiskTrajectoryStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    async fn dump(&self, trajectory: &Trajectory) -> Result<(), AgentError> {
        let dir = self.run_dir(&trajectory.run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::io(format!("create_dir: {}", e)))?;
        trajectory.write_to_file(dir.join("trajectory.json")).await
    }
}

#[async_trait]
impl TrajectoryStore for DiskTrajectoryStore {
    async fn write_run_start(&self, trajectory: &Trajectory) -> Result<(), AgentError> {
        self.dump(trajectory).await
    }

    async fn write_action(
        &self,
        trajectory: &Trajectory,
        _action: &Action,
        screenshot_b64: Option<&str>,
    ) -> Result<(), AgentError> {
        self.dump(trajectory).await?;
        if let Some(b64) = screenshot_b64 {
            let png = B64
                .decode(b64)
                .map_err(|e| AgentError::io(format!("b64 decode: {}", e)))?;
            let name = format!("step_{:03}.png", trajectory.actions.len());
            async_fs::write(self.run_dir(&trajectory.run_id).join(name), &png)
                .await
                .map_err(|e| AgentError::io(format!("write: {}", e)))?;
        }
        Ok(())
    }

    async fn write_run_end(&self, trajectory: &Trajectory) -> Result<(), AgentError> {
        self.dump(trajectory).await
    }
}

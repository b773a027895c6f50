pub mod action;
pub mod agent;
pub mod browser;
pub mod driver;
pub mod engine;
pub mod error;
pub mod llm;
pub mod retriever;
pub mod search;
pub mod sim;
pub mod trajectory;
pub mod world_model;

pub use action::{Action, ActionPayload, ActionRegistry, ActionSchema, ActionStatus};
pub use agent::{Agent, AgentConfig};
pub use browser::{BrowserConfig, ChromiumDriver};
pub use driver::{Driver, PageState, SnapshotHandle};
pub use engine::{ActionEngine, EngineConfig, ExecutionResult};
pub use error::{AgentError, DriverError, LlmError};
pub use llm::{LanguageModel, OpenAiClient, OpenAiConfig};
pub use retriever::{Retriever, RetrieverPipeline};
pub use search::{FnScorer, LlmScorer, Scorer, SearchConfig, TreeSearch};
pub use sim::{ScriptedModel, SimulatedDriver};
pub use trajectory::{DiskTrajectoryStore, NullTrajectoryStore, RunStatus, Trajectory, TrajectoryStore};
pub use world_model::{Engine, Instruction, LlmWorldModel, WorldModel};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{ControlCommand, NavigationCommand};
use crate::error::DriverError;

/// Raw page state as seen by the driver, before any retrieval narrowing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: Option<String>,
    pub html: String,
    pub screenshot_b64: Option<String>,
    pub tab_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub locator: String,
    pub tag: Option<String>,
    pub text: String,
    pub outer_html: String,
}

/// Opaque handle to a saved browser state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle(pub String);

impl SnapshotHandle {
    pub fn new() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Browser capabilities the agent needs. Not-found and timeouts come back as
/// `DriverError` values.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    async fn find(&self, locator: &str) -> Result<DomNode, DriverError>;
    /// Performs a navigation command against an element. `locator` is ignored by
    /// commands that do not target an element.
    async fn interact(
        &self,
        command: NavigationCommand,
        locator: &str,
        value: Option<&str>,
    ) -> Result<(), DriverError>;
    async fn control(&self, command: ControlCommand, value: Option<&str>) -> Result<(), DriverError>;
    async fn page_state(&self) -> Result<PageState, DriverError>;
    async fn snapshot(&self) -> Result<SnapshotHandle, DriverError>;
    async fn restore(&self, handle: &SnapshotHandle) -> Result<(), DriverError>;
    /// Frees a saved state. Releasing an unknown handle is a no-op.
    async fn release(&self, handle: &SnapshotHandle);
}

/// Awaits a driver call for at most `deadline`.
pub async fn within<T, F>(deadline: Duration, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(DriverError::Timeout(format!("{} ms", deadline.as_millis()))),
    }
}

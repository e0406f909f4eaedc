//! Contract of the remote resource client.
//!
//! The engine never speaks HTTP itself. Implementations map these calls onto
//! the server API and map failures onto [`Error`](crate::Error) (see
//! [`Error::from_response`](crate::Error::from_response)).

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::Result;
use crate::schema::ResourceKind;
use crate::task::TaskHandle;

/// Field map at the wire boundary (kebab-case keys).
pub type WireMap = serde_json::Map<String, serde_json::Value>;

/// A resource as returned by a raw read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResource {
    pub fields: WireMap,
    pub digest: Option<String>,
}

/// Result of a mutating call that may run asynchronously on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The call completed synchronously.
    Done,
    /// The server started a task that must be polled to completion.
    Task(TaskHandle),
}

/// Status of a server task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// Raw CRUD and task calls against the remote API.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Read one resource. Absence is `Error::NotFound`.
    async fn read(&self, kind: &ResourceKind, id: &str) -> Result<RawResource>;

    /// Create a resource. `fields` already contains the identifier field.
    async fn create(&self, kind: &ResourceKind, fields: &WireMap) -> Result<CreateOutcome>;

    /// Apply value updates and an explicit delete-list in one request.
    async fn update(
        &self,
        kind: &ResourceKind,
        id: &str,
        updates: &WireMap,
        deletes: &[String],
        digest: &Digest,
    ) -> Result<()>;

    /// Delete a resource. Absence is `Error::NotFound`.
    async fn delete(
        &self,
        kind: &ResourceKind,
        id: &str,
        digest: Option<&Digest>,
    ) -> Result<CreateOutcome>;

    /// Poll the status of a task running on `node`.
    async fn task_status(&self, node: &str, handle: &TaskHandle) -> Result<TaskStatus>;

    /// Names of the server's nodes.
    async fn list_nodes(&self) -> Result<Vec<String>>;
}

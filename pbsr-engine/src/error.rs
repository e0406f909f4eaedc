//! Engine error types.

use std::time::Duration;

use thiserror::Error;

use crate::retry::is_lock_message;
use crate::task::TaskHandle;

/// Errors surfaced by a reconciliation cycle.
///
/// Every variant keeps the server's message verbatim (and the task handle
/// where one exists) so callers can decide what to show the user.
#[derive(Debug, Error)]
pub enum Error {
    /// Desired state or request rejected before or by the server. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Digest mismatch on write (optimistic concurrency control).
    /// Not retried in place; the caller starts a fresh read-diff-write cycle.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Server-side exclusive lock could not be acquired.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Task finished with a failure status.
    #[error("task {handle} failed: {message}")]
    TaskFailed { handle: TaskHandle, message: String },

    /// Task failed on a known downstream incompatibility. Retrying cannot help.
    #[error("known compatibility issue (task {handle}): {message}")]
    KnownIncompatibility { handle: TaskHandle, message: String },

    /// Task did not reach a terminal status before the wait deadline.
    #[error("task {handle} did not complete within {timeout:?}")]
    TaskTimeout { handle: TaskHandle, timeout: Duration },

    /// The caller's cancellation token fired during a blocking wait.
    #[error("cancelled")]
    Cancelled,

    /// Transient failures outlasted the retry policy.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    /// Any other non-success response from the server.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Request never produced a server response.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed data from the server.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success server response onto the error taxonomy.
    pub fn from_response(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if is_lock_message(&message) {
            Error::LockContention(message)
        } else if status == 409 || lower.contains("detected modified configuration") {
            Error::Conflict(message)
        } else if status == 404 || lower.contains("not found") || lower.contains("does not exist")
        {
            Error::NotFound(message)
        } else if status == 400 {
            Error::Validation(message)
        } else {
            Error::Api { status, message }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Task handle the error refers to, if any.
    pub fn task_handle(&self) -> Option<&TaskHandle> {
        match self {
            Error::TaskFailed { handle, .. }
            | Error::KnownIncompatibility { handle, .. }
            | Error::TaskTimeout { handle, .. } => Some(handle),
            Error::RetriesExhausted { last, .. } => last.task_handle(),
            _ => None,
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::LockContention(_) => "lock-contention",
            Error::NotFound(_) => "not-found",
            Error::TaskFailed { .. } => "task-failed",
            Error::KnownIncompatibility { .. } => "known-incompatibility",
            Error::TaskTimeout { .. } => "task-timeout",
            Error::Cancelled => "cancelled",
            Error::RetriesExhausted { .. } => "retries-exhausted",
            Error::Api { .. } => "api",
            Error::Transport(_) => "transport",
            Error::Internal(_) => "internal",
        }
    }
}

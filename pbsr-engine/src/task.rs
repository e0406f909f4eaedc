//! Asynchronous task monitor.
//!
//! Some mutating calls return a task handle (UPID) instead of completing
//! synchronously. [`TaskMonitor::await_task`] polls the task until it
//! reaches a terminal status, the deadline passes, or the caller cancels.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{RemoteClient, TaskStatus};
use crate::error::{Error, Result};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default upper bound for one task wait.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Opaque task handle.
///
/// Handles usually look like `UPID:<node>:<pid>:<pstart>:<task>:<start>:<type>:<id>:<user>:`
/// but only the node segment is ever interpreted, and even that is optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Node encoded in the handle's `<kind>:<node>:...` prefix.
    pub fn node(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        let kind = parts.next()?;
        let node = parts.next()?;
        if kind.trim().is_empty() || node.trim().is_empty() {
            return None;
        }
        Some(node)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a task failure is the known S3 provider incompatibility
/// (provider rejects the access-time safety check with 501 Not Implemented).
pub fn is_known_incompatibility(message: &str) -> bool {
    message.contains("501")
        && message.contains("Not Implemented")
        && message.contains("access time safety check")
}

/// Build the error for a task that finished with a failure status.
pub fn task_failure(handle: &TaskHandle, message: String) -> Error {
    if is_known_incompatibility(&message) {
        Error::KnownIncompatibility {
            handle: handle.clone(),
            message,
        }
    } else {
        Error::TaskFailed {
            handle: handle.clone(),
            message,
        }
    }
}

/// Polls task status on a fixed interval.
#[derive(Debug, Clone)]
pub struct TaskMonitor {
    poll_interval: Duration,
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl TaskMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Node that runs the task: parsed from the handle, else the first node
    /// the server lists.
    pub async fn resolve_node<C>(&self, client: &C, handle: &TaskHandle) -> Result<String>
    where
        C: RemoteClient + ?Sized,
    {
        if let Some(node) = handle.node() {
            return Ok(node.to_string());
        }

        debug!(upid = %handle, "Task handle has no node prefix, asking the server");
        let nodes = client.list_nodes().await?;
        nodes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal(format!("no nodes available to poll task {}", handle)))
    }

    /// Wait until the task succeeds, fails, times out, or `cancel` fires.
    pub async fn await_task<C>(
        &self,
        client: &C,
        handle: &TaskHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        C: RemoteClient + ?Sized,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let timed_out = || Error::TaskTimeout {
            handle: handle.clone(),
            timeout,
        };

        let node = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            node = tokio::time::timeout_at(deadline, self.resolve_node(client, handle)) => {
                node.map_err(|_| timed_out())??
            }
        };

        debug!(upid = %handle, node = %node, timeout_secs = timeout.as_secs(), "Waiting for task");
        let mut last_progress = start;

        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                status = tokio::time::timeout_at(deadline, client.task_status(&node, handle)) => {
                    status.map_err(|_| timed_out())??
                }
            };

            match status {
                TaskStatus::Succeeded => {
                    info!(
                        upid = %handle,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Task completed"
                    );
                    return Ok(());
                }
                TaskStatus::Failed(message) => {
                    warn!(upid = %handle, error = %message, "Task failed");
                    return Err(task_failure(handle, message));
                }
                TaskStatus::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if now.duration_since(last_progress) >= PROGRESS_LOG_INTERVAL {
                debug!(
                    upid = %handle,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Task still running"
                );
                last_progress = now;
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        warn!(upid = %handle, timeout_secs = timeout.as_secs(), "Timeout waiting for task");
        Err(timed_out())
    }
}

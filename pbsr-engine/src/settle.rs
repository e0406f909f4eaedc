//! Eventual-consistency reader.
//!
//! After a task-backed mutation finishes the server may still take a moment
//! before the resource shows up in reads. [`read_with_settle`] retries the
//! read with a capped exponential backoff until it appears.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::RemoteClient;
use crate::error::{Error, Result};
use crate::field::ResourceState;
use crate::retry::Backoff;
use crate::schema::ResourceKind;

/// Attempt cap and delay schedule for settle reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(5),
            },
        }
    }
}

/// Read a resource, retrying while the server reports it as not found.
///
/// Returns the first successful read. Any error other than `NotFound` is
/// returned immediately; exhausting the attempts returns the last
/// `NotFound`. No sleep follows the final attempt.
pub async fn read_with_settle<C>(
    client: &C,
    kind: &ResourceKind,
    id: &str,
    policy: &SettlePolicy,
    cancel: &CancellationToken,
) -> Result<ResourceState>
where
    C: RemoteClient + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match client.read(kind, id).await {
            Ok(raw) => {
                if attempt > 1 {
                    debug!(kind = kind.name, id, attempt, "Resource visible after settling");
                }
                return kind.decode_resource(id, raw);
            }
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        if attempt == max_attempts {
            debug!(kind = kind.name, id, attempts = max_attempts, "Resource still not visible");
            return Err(err);
        }

        let delay = policy.backoff.delay(attempt);
        debug!(
            kind = kind.name,
            id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Resource not visible yet"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Err(Error::NotFound(format!("{} '{}'", kind.name, id)))
}

//! Bounded retry for mutating calls that race a server-side exclusive lock.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Messages the server emits when its exclusive config lock is held.
const LOCK_PATTERNS: &[&str] = &[
    "Unable to acquire lock",
    "Interrupted system call",
    ".datastore.lck",
];

/// Whether an error message indicates contention on a server-side lock.
pub fn is_lock_message(message: &str) -> bool {
    LOCK_PATTERNS.iter().any(|p| message.contains(p))
}

/// How a failure should be treated by [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Fatal,
    Transient,
}

/// Default classifier: only positively identified lock contention is
/// transient, everything else is fatal.
pub fn classify_lock_contention(err: &Error) -> Classification {
    match err {
        Error::LockContention(_) => Classification::Transient,
        Error::TaskFailed { message, .. } if is_lock_message(message) => Classification::Transient,
        Error::Api { message, .. } if is_lock_message(message) => Classification::Transient,
        _ => Classification::Fatal,
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `attempt * base`
    Linear(Duration),
    /// `base * 2^(attempt - 1)`, capped.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(base) => base.saturating_mul(attempt),
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Retry policy for one mutating operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub classify: fn(&Error) -> Classification,
}

impl RetryPolicy {
    /// Policy for the lock-contended creation path: 3 attempts, linear 2s.
    pub fn lock_contended() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear(Duration::from_secs(2)),
            classify: classify_lock_contention,
        }
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            classify: classify_lock_contention,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// The sleep before attempt `n + 1` is `policy.backoff.delay(n)`. Sleeps
/// return [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = policy.backoff.delay(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => match (policy.classify)(&e) {
                Classification::Fatal => return Err(e),
                Classification::Transient => {
                    if attempt < max_attempts {
                        warn!(
                            attempt,
                            max_attempts,
                            delay_ms = policy.backoff.delay(attempt).as_millis() as u64,
                            error = %e,
                            "Transient failure, retrying"
                        );
                    }
                    last_error = Some(e);
                }
            },
        }
    }

    let last = last_error.unwrap_or_else(|| Error::Internal("retry loop ran no attempts".into()));
    Err(Error::RetriesExhausted {
        attempts: max_attempts,
        last: Box::new(last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskHandle;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Linear(Duration::from_millis(100)),
            classify: classify_lock_contention,
        }
    }

    #[test]
    fn test_backoff_schedules() {
        let linear = Backoff::Linear(Duration::from_secs(2));
        assert_eq!(linear.delay(1), Duration::from_secs(2));
        assert_eq!(linear.delay(2), Duration::from_secs(4));

        let exp = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5),
        };
        assert_eq!(exp.delay(1), Duration::from_secs(1));
        assert_eq!(exp.delay(2), Duration::from_secs(2));
        assert_eq!(exp.delay(3), Duration::from_secs(4));
        assert_eq!(exp.delay(4), Duration::from_secs(5));
        assert_eq!(exp.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify_lock_contention(&Error::LockContention("busy".into())),
            Classification::Transient
        );
        assert_eq!(
            classify_lock_contention(&Error::TaskFailed {
                handle: TaskHandle::new("UPID:pbs:1"),
                message: "unable to open lock /etc/proxmox-backup/.datastore.lck".into(),
            }),
            Classification::Transient
        );
        assert_eq!(
            classify_lock_contention(&Error::Validation("bad path".into())),
            Classification::Fatal
        );
        assert_eq!(
            classify_lock_contention(&Error::Api {
                status: 500,
                message: "something odd".into()
            }),
            Classification::Fatal
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&counting_policy(3), &cancel, |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::LockContention("Unable to acquire lock".into()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::LockContention(_)));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&counting_policy(3), &cancel, |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("path is required".into()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = with_retry(&counting_policy(3), &cancel, |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(Error::LockContention("Interrupted system call".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_delays_between_attempts() {
        let start = tokio::time::Instant::now();
        let cancel = CancellationToken::new();

        let _: Result<()> = with_retry(&counting_policy(3), &cancel, |_| async {
            Err(Error::LockContention("busy".into()))
        })
        .await;

        // 100ms after attempt 1, 200ms after attempt 2
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Fixed(Duration::from_secs(60)),
            classify: classify_lock_contention,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<()> = with_retry(&policy, &cancel, |_| async {
            Err(Error::LockContention("busy".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}

//! Client-side locks keyed by resource class.
//!
//! The server guards some resource classes with one exclusive lock for the
//! whole class. Serializing our own mutations of such a class avoids
//! provoking lock contention in the first place; the retry controller only
//! has to absorb contention caused by other clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

/// Holds one class lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    class: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        trace!(class = %self.class, "Released class lock");
    }
}

/// Registry of per-class mutexes, shared by every reconciler of a process.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, class: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the class lock. Returns `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, class: &str, cancel: &CancellationToken) -> Result<LockGuard> {
        let mutex = self.mutex_for(class);
        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = mutex.lock_owned() => guard,
        };
        trace!(class, "Acquired class lock");
        Ok(LockGuard {
            class: class.to_string(),
            _guard: guard,
        })
    }

    /// Acquire the lock if the class is set; `None` means no locking.
    pub async fn acquire_optional(
        &self,
        class: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<LockGuard>> {
        match class {
            Some(class) => self.acquire(class, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Whether the class lock is currently held.
    pub fn is_locked(&self, class: &str) -> bool {
        self.mutex_for(class).try_lock().is_err()
    }
}

//! pbsr-engine: reconciliation core for Proxmox Backup Server configuration.
//!
//! The engine compares a desired state against the configuration the server
//! reports and converges it:
//! - computes the minimal update payload and explicit delete-list ([`diff`])
//! - threads the server's optimistic-locking digest into every write ([`digest`])
//! - waits for task-backed mutations to finish ([`task`])
//! - retries creates that hit server-side lock contention ([`retry`])
//! - absorbs the propagation delay between "task done" and "resource visible" ([`settle`])
//!
//! Transport is out of scope: the engine talks to the server through the
//! [`RemoteClient`] trait. [`test_util::MemoryClient`] is an in-memory
//! implementation for tests.

pub mod client;
pub mod diff;
pub mod digest;
pub mod error;
pub mod field;
pub mod kinds;
pub mod lock;
pub mod property;
pub mod reconciler;
pub mod retry;
pub mod schema;
pub mod settle;
pub mod task;
pub mod test_util;

pub use client::{CreateOutcome, RawResource, RemoteClient, TaskStatus, WireMap};
pub use diff::{ChangeSet, Diff, apply_change_set, compute_change_set, sent_after};
pub use digest::{Digest, DigestCarrier};
pub use error::{Error, Result};
pub use field::{DesiredState, Field, Fingerprints, ResourceState, Value, fingerprint};
pub use lock::{LockGuard, LockManager};
pub use reconciler::{Action, KindReconciler, Outcome, Plan, ReconcileSettings, Reconciler};
pub use retry::{Backoff, Classification, RetryPolicy, with_retry};
pub use schema::{FieldSpec, FieldType, ResourceKind};
pub use settle::{SettlePolicy, read_with_settle};
pub use task::{TaskHandle, TaskMonitor};

//! Reconciler for one resource kind.
//!
//! One cycle reads the resource, diffs it against the desired state and
//! converges it with at most one mutating call:
//!
//! `read -> diff -> {no-op | create | update | replacement} -> [await task] -> settle read`
//!
//! Replacement is reported to the caller, never executed here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CreateOutcome, RemoteClient, WireMap};
use crate::diff::{ChangeSet, Diff, compute_change_set, sent_after};
use crate::digest::{Digest, DigestCarrier};
use crate::error::{Error, Result};
use crate::field::{DesiredState, Fingerprints, ResourceState};
use crate::lock::LockManager;
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::ResourceKind;
use crate::settle::{SettlePolicy, read_with_settle};
use crate::task::{DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT, TaskMonitor};

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The desired state type.
    type Spec;
    /// The result reported back to the caller.
    type Status;

    /// Compare desired vs. actual state and converge.
    ///
    /// `digest` is the caller's persisted digest from the previous cycle.
    async fn reconcile(
        &self,
        spec: &Self::Spec,
        digest: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<Self::Status>;

    /// Remove the resource. Already absent counts as success.
    async fn finalize(
        &self,
        id: &str,
        digest: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Tunables of a reconciliation cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Upper bound for one task wait.
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    /// Policy for creates; the kind's classifier replaces `classify`.
    pub create_retry: RetryPolicy,
    pub settle: SettlePolicy,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            create_retry: RetryPolicy::lock_contended(),
            settle: SettlePolicy::default(),
        }
    }
}

/// What a reconcile cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    Created,
    Updated {
        updates: Vec<String>,
        deletes: Vec<String>,
    },
    /// Immutable fields differ; nothing was changed.
    ReplacementRequired { fields: Vec<String> },
}

/// Result of a reconcile cycle.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub id: String,
    pub action: Action,
    /// State after the cycle (the prior state if nothing was written).
    pub state: ResourceState,
    /// Digest to persist for the next cycle.
    pub digest: Option<Digest>,
}

/// What a reconcile cycle would do, without writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Create(ChangeSet),
    Update(ChangeSet),
    NoOp,
    Replace(Vec<String>),
}

/// Reconciler driving one [`ResourceKind`] through a [`RemoteClient`].
pub struct KindReconciler<C: ?Sized> {
    kind: &'static ResourceKind,
    client: Arc<C>,
    locks: Arc<LockManager>,
    monitor: TaskMonitor,
    settings: ReconcileSettings,
}

impl<C> KindReconciler<C>
where
    C: RemoteClient + ?Sized,
{
    pub fn new(
        kind: &'static ResourceKind,
        client: Arc<C>,
        locks: Arc<LockManager>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            kind,
            client,
            locks,
            monitor: TaskMonitor::new(settings.poll_interval),
            settings,
        }
    }

    pub fn kind(&self) -> &'static ResourceKind {
        self.kind
    }

    /// Read the current state; `None` if the resource does not exist.
    async fn read_prior(&self, id: &str, sent: &Fingerprints) -> Result<Option<ResourceState>> {
        match self.client.read(self.kind, id).await {
            Ok(raw) => {
                let mut state = self.kind.decode_resource(id, raw)?;
                state.sent = sent.clone();
                Ok(Some(state))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read and diff without writing.
    pub async fn plan(&self, desired: &DesiredState) -> Result<Plan> {
        self.plan_with_sent(desired, &Fingerprints::new()).await
    }

    /// [`plan`](Self::plan), comparing write-only fields against `sent`.
    pub async fn plan_with_sent(&self, desired: &DesiredState, sent: &Fingerprints) -> Result<Plan> {
        self.kind.check_desired(desired)?;
        let prior = self.read_prior(&desired.id, sent).await?;

        Ok(match compute_change_set(self.kind, desired, prior.as_ref()) {
            Diff::RequiresReplacement(fields) => Plan::Replace(fields),
            Diff::Changes(changes) if prior.is_none() => Plan::Create(changes),
            Diff::Changes(changes) if changes.is_empty() => Plan::NoOp,
            Diff::Changes(changes) => Plan::Update(changes),
        })
    }

    /// One create attempt: the class lock covers the create call only, the
    /// task is awaited after releasing it.
    async fn create_once(&self, body: &WireMap, cancel: &CancellationToken) -> Result<()> {
        let outcome = {
            let _guard = self.locks.acquire_optional(self.kind.lock_class, cancel).await?;
            self.client.create(self.kind, body).await?
        };

        match outcome {
            CreateOutcome::Done => Ok(()),
            CreateOutcome::Task(handle) => {
                self.monitor
                    .await_task(self.client.as_ref(), &handle, self.settings.task_timeout, cancel)
                    .await
            }
        }
    }

    async fn create(
        &self,
        desired: &DesiredState,
        changes: &ChangeSet,
        cancel: &CancellationToken,
    ) -> Result<ResourceState> {
        let id = desired.id.as_str();
        info!(kind = self.kind.name, id, fields = changes.updates.len(), "Creating resource");

        let body = self.kind.create_body(id, changes.updates.iter());
        let policy = RetryPolicy {
            classify: self.kind.classify,
            ..self.settings.create_retry
        };

        let body = &body;
        with_retry(&policy, cancel, move |_| self.create_once(body, cancel)).await?;

        self.settle(id, cancel).await
    }

    async fn update(
        &self,
        id: &str,
        changes: &ChangeSet,
        carrier: &DigestCarrier,
        cancel: &CancellationToken,
    ) -> Result<ResourceState> {
        let digest = carrier.for_write(id)?;
        let updates = self.kind.encode_fields(changes.updates.iter());
        info!(
            kind = self.kind.name,
            id,
            updates = ?changes.updates.keys().collect::<Vec<_>>(),
            deletes = ?changes.deletes,
            "Updating resource"
        );

        {
            let _guard = self.locks.acquire_optional(self.kind.lock_class, cancel).await?;
            self.client
                .update(self.kind, id, &updates, &changes.deletes, digest)
                .await?;
        }

        self.settle(id, cancel).await
    }

    /// One reconcile cycle.
    ///
    /// `sent` holds the write-only fingerprints from the previous cycle
    /// (`Outcome::state.sent`); the outcome carries the updated set.
    pub async fn reconcile_with_sent(
        &self,
        desired: &DesiredState,
        digest: Option<&Digest>,
        sent: &Fingerprints,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let id = desired.id.as_str();
        self.kind.check_desired(desired)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut carrier = DigestCarrier::new(digest.cloned());
        let prior = self.read_prior(id, sent).await?;
        if let Some(prior) = &prior {
            carrier.observe(prior);
        }

        let changes = match compute_change_set(self.kind, desired, prior.as_ref()) {
            Diff::RequiresReplacement(fields) => {
                warn!(
                    kind = self.kind.name,
                    id,
                    fields = ?fields,
                    "Immutable fields changed, resource must be replaced"
                );
                let state = prior.unwrap_or_else(|| ResourceState::new(id));
                return Ok(Outcome {
                    id: id.to_string(),
                    action: Action::ReplacementRequired { fields },
                    state,
                    digest: carrier.into_inner(),
                });
            }
            Diff::Changes(changes) => changes,
        };

        let written = if prior.is_some() { sent.clone() } else { Fingerprints::new() };
        let (action, mut state) = match prior {
            None => {
                let state = self.create(desired, &changes, cancel).await?;
                (Action::Created, state)
            }
            Some(prior) if changes.is_empty() => {
                debug!(kind = self.kind.name, id, "Resource up to date");
                (Action::NoOp, prior)
            }
            Some(_) => {
                let state = self.update(id, &changes, &carrier, cancel).await?;
                let action = Action::Updated {
                    updates: changes.updates.keys().cloned().collect(),
                    deletes: changes.deletes.clone(),
                };
                (action, state)
            }
        };

        state.sent = sent_after(self.kind, desired, &written, &changes);
        carrier.observe(&state);
        Ok(Outcome {
            id: id.to_string(),
            action,
            state,
            digest: carrier.into_inner(),
        })
    }

    async fn settle(&self, id: &str, cancel: &CancellationToken) -> Result<ResourceState> {
        read_with_settle(self.client.as_ref(), self.kind, id, &self.settings.settle, cancel).await
    }
}

#[async_trait]
impl<C> Reconciler for KindReconciler<C>
where
    C: RemoteClient + ?Sized,
{
    type Spec = DesiredState;
    type Status = Outcome;

    async fn reconcile(
        &self,
        desired: &DesiredState,
        digest: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        self.reconcile_with_sent(desired, digest, &Fingerprints::new(), cancel)
            .await
    }

    async fn finalize(
        &self,
        id: &str,
        digest: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut carrier = DigestCarrier::new(digest.cloned());
        let Some(prior) = self.read_prior(id, &Fingerprints::new()).await? else {
            info!(kind = self.kind.name, id, "Resource already absent");
            return Ok(());
        };
        carrier.observe(&prior);
        let digest = carrier.for_write(id)?;

        info!(kind = self.kind.name, id, "Deleting resource");
        let outcome = {
            let _guard = self.locks.acquire_optional(self.kind.lock_class, cancel).await?;
            match self.client.delete(self.kind, id, Some(digest)).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_not_found() => {
                    info!(kind = self.kind.name, id, "Resource vanished before delete");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        if let CreateOutcome::Task(handle) = outcome {
            self.monitor
                .await_task(self.client.as_ref(), &handle, self.settings.task_timeout, cancel)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Value;
    use crate::kinds::REMOTE;
    use crate::test_util::MemoryClient;

    fn reconciler(client: Arc<MemoryClient>) -> KindReconciler<MemoryClient> {
        KindReconciler::new(
            &REMOTE,
            client,
            Arc::new(LockManager::new()),
            ReconcileSettings::default(),
        )
    }

    fn remote() -> DesiredState {
        DesiredState::new("offsite")
            .set("host", Value::text("pbs2.example.com"))
            .set("auth-id", Value::text("sync@pbs"))
    }

    #[tokio::test]
    async fn test_plan_create_then_noop() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(client.clone());

        assert!(matches!(reconciler.plan(&remote()).await.unwrap(), Plan::Create(_)));

        client.insert(&REMOTE, &remote());
        assert_eq!(reconciler.plan(&remote()).await.unwrap(), Plan::NoOp);
        assert_eq!(client.calls().creates, 0);
    }

    #[tokio::test]
    async fn test_plan_update_lists_deletes() {
        let client = Arc::new(MemoryClient::new());
        client.insert(&REMOTE, &remote().set("comment", Value::text("old")));
        let reconciler = reconciler(client.clone());

        match reconciler.plan(&remote()).await.unwrap() {
            Plan::Update(changes) => assert_eq!(changes.deletes, vec!["comment".to_string()]),
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(client.calls().updates, 0);
    }

    #[tokio::test]
    async fn test_invalid_desired_state_makes_no_calls() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(client.clone());
        let desired = DesiredState::new("offsite").set("host", Value::text("pbs2"));

        let err = reconciler
            .reconcile(&desired, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(client.calls().reads, 0);
    }

    #[tokio::test]
    async fn test_finalize_absent_is_success() {
        let client = Arc::new(MemoryClient::new());
        let reconciler = reconciler(client.clone());

        reconciler
            .finalize("offsite", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.calls().deletes, 0);
    }
}

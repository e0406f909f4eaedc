//! Manifest-level reconciliation.
//!
//! Resources are processed in tiers of the engine's creation order (S3
//! endpoints and remotes, then datastores, then jobs). Within a tier every
//! resource is reconciled concurrently; the class locks serialize mutations
//! that contend on the same server-side lock. Pruning walks the tiers in
//! reverse so jobs disappear before the datastores they reference.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use pbsr_engine::kinds;
use pbsr_engine::{
    Action, Digest, Error, Fingerprints, KindReconciler, LockManager, Outcome, Plan,
    ReconcileSettings, Reconciler, RemoteClient, ResourceKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AgentAuditLogger;
use crate::manifest::{Manifest, ManifestResource};
use crate::state::State;

/// What happened to one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated {
        updates: Vec<String>,
        deletes: Vec<String>,
    },
    Unchanged,
    /// Deleted and recreated because immutable fields changed.
    Replaced { fields: Vec<String> },
    /// Immutable fields changed and replacement was not allowed.
    ReplacementRequired { fields: Vec<String> },
    Deleted,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Created => write!(f, "created"),
            Change::Updated { updates, deletes } => write!(
                f,
                "updated (set: [{}], deleted: [{}])",
                updates.join(", "),
                deletes.join(", ")
            ),
            Change::Unchanged => write!(f, "unchanged"),
            Change::Replaced { fields } => write!(f, "replaced ({})", fields.join(", ")),
            Change::ReplacementRequired { fields } => write!(
                f,
                "requires replacement ({}), rerun with --allow-replace",
                fields.join(", ")
            ),
            Change::Deleted => write!(f, "deleted"),
        }
    }
}

/// Result for one resource.
#[derive(Debug)]
pub struct ResourceReport {
    pub kind: String,
    pub id: String,
    pub result: Result<Change, Error>,
}

impl ResourceReport {
    /// Errors and unexecuted replacements count as failures.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.result,
            Err(_) | Ok(Change::ReplacementRequired { .. })
        )
    }
}

impl fmt::Display for ResourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(change) => write!(f, "{} '{}': {}", self.kind, self.id, change),
            Err(e) => write!(f, "{} '{}': FAILED: {}", self.kind, self.id, e),
        }
    }
}

/// Results of an apply or destroy run.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub resources: Vec<ResourceReport>,
}

impl ApplyReport {
    pub fn failures(&self) -> usize {
        self.resources.iter().filter(|r| r.is_failure()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.kind == kind && r.id == id)
    }
}

/// Planned change for one manifest resource.
#[derive(Debug)]
pub struct PlannedResource {
    pub kind: &'static str,
    pub id: String,
    pub plan: Result<Plan, Error>,
}

/// Output of a dry run.
#[derive(Debug, Default)]
pub struct PlanReport {
    pub resources: Vec<PlannedResource>,
    /// Managed resources that are no longer declared, as `(kind, id)`.
    pub prunes: Vec<(String, String)>,
}

impl PlanReport {
    pub fn has_errors(&self) -> bool {
        self.resources.iter().any(|r| r.plan.is_err())
    }

    pub fn has_changes(&self) -> bool {
        !self.prunes.is_empty()
            || self
                .resources
                .iter()
                .any(|r| !matches!(r.plan, Ok(Plan::NoOp)))
    }
}

impl fmt::Display for PlanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.resources {
            match &r.plan {
                Ok(Plan::Create(changes)) => {
                    let fields: Vec<_> = changes.updates.keys().map(String::as_str).collect();
                    writeln!(f, "+ {} '{}' ({})", r.kind, r.id, fields.join(", "))?;
                }
                Ok(Plan::Update(changes)) => {
                    let updates: Vec<_> = changes.updates.keys().map(String::as_str).collect();
                    writeln!(
                        f,
                        "~ {} '{}' (set: [{}], delete: [{}])",
                        r.kind,
                        r.id,
                        updates.join(", "),
                        changes.deletes.join(", ")
                    )?;
                }
                Ok(Plan::NoOp) => writeln!(f, "  {} '{}'", r.kind, r.id)?,
                Ok(Plan::Replace(fields)) => writeln!(
                    f,
                    "! {} '{}' must be replaced (immutable: {})",
                    r.kind,
                    r.id,
                    fields.join(", ")
                )?,
                Err(e) => writeln!(f, "x {} '{}': {}", r.kind, r.id, e)?,
            }
        }
        for (kind, id) in &self.prunes {
            writeln!(f, "- {} '{}'", kind, id)?;
        }
        Ok(())
    }
}

/// Group items by creation rank, lowest rank first.
fn tiers<T>(items: impl IntoIterator<Item = T>, rank: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut by_rank: BTreeMap<usize, Vec<T>> = BTreeMap::new();
    for item in items {
        by_rank.entry(rank(&item)).or_default().push(item);
    }
    by_rank.into_values().collect()
}

/// Reconciles a manifest against the server.
#[derive(Clone)]
pub struct Agent {
    client: Arc<dyn RemoteClient>,
    locks: Arc<LockManager>,
    settings: ReconcileSettings,
    audit: Arc<AgentAuditLogger>,
}

impl Agent {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        settings: ReconcileSettings,
        audit: Arc<AgentAuditLogger>,
    ) -> Self {
        Self {
            client,
            locks: Arc::new(LockManager::new()),
            settings,
            audit,
        }
    }

    fn reconciler(&self, kind: &'static ResourceKind) -> KindReconciler<dyn RemoteClient> {
        KindReconciler::new(kind, self.client.clone(), self.locks.clone(), self.settings)
    }

    /// Managed resources not declared in the manifest, jobs first.
    fn unmanaged(&self, manifest: &Manifest, state: &State) -> Vec<(String, String, Option<Digest>)> {
        let mut candidates: Vec<_> = state
            .resources()
            .filter(|r| !manifest.contains(&r.kind, &r.id))
            .map(|r| (r.kind.clone(), r.id.clone(), r.digest.clone()))
            .collect();
        candidates.sort_by(|a, b| {
            kinds::creation_rank(&b.0)
                .cmp(&kinds::creation_rank(&a.0))
                .then_with(|| a.1.cmp(&b.1))
        });
        candidates
    }

    // =========================================================================
    // Plan
    // =========================================================================

    /// Read and diff every manifest resource without writing.
    pub async fn plan(&self, manifest: &Manifest, state: &State) -> PlanReport {
        let resources = join_all(manifest.resources.iter().map(|r| async move {
            PlannedResource {
                kind: r.kind.name,
                id: r.desired.id.clone(),
                plan: self
                    .reconciler(r.kind)
                    .plan_with_sent(
                        &r.desired,
                        &state.sent(r.kind.name, &r.desired.id).cloned().unwrap_or_default(),
                    )
                    .await,
            }
        }))
        .await;

        let prunes = self
            .unmanaged(manifest, state)
            .into_iter()
            .map(|(kind, id, _)| (kind, id))
            .collect();

        PlanReport { resources, prunes }
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Converge every manifest resource, then prune managed resources the
    /// manifest no longer declares. `state` is updated for every success.
    pub async fn apply(
        &self,
        manifest: &Manifest,
        state: &mut State,
        allow_replace: bool,
        cancel: &CancellationToken,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        for tier in tiers(&manifest.resources, |r| kinds::creation_rank(r.kind.name)) {
            if cancel.is_cancelled() {
                report.resources.extend(tier.iter().map(|r| ResourceReport {
                    kind: r.kind.name.to_string(),
                    id: r.desired.id.clone(),
                    result: Err(Error::Cancelled),
                }));
                continue;
            }

            debug!(
                kinds = ?tier.iter().map(|r| r.kind.name).collect::<Vec<_>>(),
                resources = tier.len(),
                "Reconciling tier"
            );
            let results = join_all(tier.iter().map(|r| {
                let digest = state.digest(r.kind.name, &r.desired.id).cloned();
                let sent = state.sent(r.kind.name, &r.desired.id).cloned().unwrap_or_default();
                self.apply_one(r, digest, sent, allow_replace, cancel)
            }))
            .await;

            for (resource, result) in tier.into_iter().zip(results) {
                let kind = resource.kind;
                let id = resource.desired.id.clone();
                let result = result.map(|(change, outcome)| {
                    state.record_outcome(kind, &outcome);
                    change
                });
                report.resources.push(ResourceReport {
                    kind: kind.name.to_string(),
                    id,
                    result,
                });
            }
        }

        let keep = |kind: &str, id: &str| manifest.contains(kind, id);
        let pruned = self.prune(state, keep, cancel).await;
        report.resources.extend(pruned);

        info!(
            resources = report.resources.len(),
            failures = report.failures(),
            "Apply finished"
        );
        report
    }

    async fn apply_one(
        &self,
        resource: &ManifestResource,
        digest: Option<Digest>,
        sent: Fingerprints,
        allow_replace: bool,
        cancel: &CancellationToken,
    ) -> Result<(Change, Outcome), Error> {
        let kind = resource.kind;
        let id = resource.desired.id.as_str();
        let reconciler = self.reconciler(kind);

        let result = async {
            let outcome = reconciler
                .reconcile_with_sent(&resource.desired, digest.as_ref(), &sent, cancel)
                .await?;

            let change = match &outcome.action {
                Action::NoOp => Change::Unchanged,
                Action::Created => {
                    self.audit
                        .resource_created(kind.name, id, outcome.digest.as_ref())
                        .await;
                    Change::Created
                }
                Action::Updated { updates, deletes } => {
                    self.audit
                        .resource_updated(kind.name, id, updates, deletes, outcome.digest.as_ref())
                        .await;
                    Change::Updated {
                        updates: updates.clone(),
                        deletes: deletes.clone(),
                    }
                }
                Action::ReplacementRequired { fields } if allow_replace => {
                    warn!(kind = kind.name, id, fields = ?fields, "Replacing resource");
                    let fields = fields.clone();
                    reconciler.finalize(id, outcome.digest.as_ref(), cancel).await?;
                    self.audit
                        .resource_deleted(kind.name, id, outcome.digest.as_ref())
                        .await;

                    let recreated = reconciler.reconcile(&resource.desired, None, cancel).await?;
                    self.audit
                        .resource_created(kind.name, id, recreated.digest.as_ref())
                        .await;
                    return Ok::<_, Error>((Change::Replaced { fields }, recreated));
                }
                Action::ReplacementRequired { fields } => {
                    self.audit.replacement_required(kind.name, id, fields).await;
                    Change::ReplacementRequired {
                        fields: fields.clone(),
                    }
                }
            };
            Ok::<_, Error>((change, outcome))
        }
        .await;

        match &result {
            Ok((change, _)) => info!(kind = kind.name, id, %change, "Reconciled"),
            Err(e) => {
                error!(kind = kind.name, id, error = %e, error_kind = e.kind(), "Reconcile failed");
                self.audit.reconcile_failed(kind.name, id, e).await;
            }
        }
        result
    }

    // =========================================================================
    // Prune / Destroy
    // =========================================================================

    /// Finalize every managed resource for which `keep` is false, in reverse
    /// creation order. Removed resources are dropped from `state`.
    async fn prune(
        &self,
        state: &mut State,
        keep: impl Fn(&str, &str) -> bool,
        cancel: &CancellationToken,
    ) -> Vec<ResourceReport> {
        let candidates: Vec<_> = state
            .resources()
            .filter(|r| !keep(&r.kind, &r.id))
            .map(|r| (r.kind.clone(), r.id.clone(), r.digest.clone()))
            .collect();
        let mut reports = Vec::new();

        let mut ordered = tiers(candidates, |(kind, _, _)| kinds::creation_rank(kind));
        ordered.reverse();

        for tier in ordered {
            if cancel.is_cancelled() {
                reports.extend(tier.into_iter().map(|(kind, id, _)| ResourceReport {
                    kind,
                    id,
                    result: Err(Error::Cancelled),
                }));
                continue;
            }

            let results = join_all(
                tier.iter()
                    .map(|(kind, id, digest)| self.delete_one(kind, id, digest.as_ref(), cancel)),
            )
            .await;

            for ((kind, id, _), result) in tier.into_iter().zip(results) {
                if result.is_ok() {
                    state.remove(&kind, &id);
                }
                reports.push(ResourceReport { kind, id, result });
            }
        }
        reports
    }

    async fn delete_one(
        &self,
        kind_name: &str,
        id: &str,
        digest: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<Change, Error> {
        let Some(kind) = kinds::by_name(kind_name) else {
            return Err(Error::Validation(format!(
                "state file references unknown kind '{}'",
                kind_name
            )));
        };

        info!(kind = kind.name, id, "Removing resource");
        match self.reconciler(kind).finalize(id, digest, cancel).await {
            Ok(()) => {
                self.audit.resource_deleted(kind.name, id, digest).await;
                Ok(Change::Deleted)
            }
            Err(e) => {
                error!(kind = kind.name, id, error = %e, error_kind = e.kind(), "Delete failed");
                self.audit.reconcile_failed(kind.name, id, &e).await;
                Err(e)
            }
        }
    }

    /// Finalize every resource recorded in `state`.
    pub async fn destroy(&self, state: &mut State, cancel: &CancellationToken) -> ApplyReport {
        let report = ApplyReport {
            resources: self.prune(state, |_, _| false, cancel).await,
        };
        info!(
            resources = report.resources.len(),
            failures = report.failures(),
            "Destroy finished"
        );
        report
    }
}

use crate::error::Result;
use crate::field::DesiredState;
use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, require};

static PRUNE_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("store").immutable(),
    FieldSpec::text("schedule"),
    FieldSpec::text("ns"),
    FieldSpec::integer("max-depth"),
    FieldSpec::integer("keep-last"),
    FieldSpec::integer("keep-hourly"),
    FieldSpec::integer("keep-daily"),
    FieldSpec::integer("keep-weekly"),
    FieldSpec::integer("keep-monthly"),
    FieldSpec::integer("keep-yearly"),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// Scheduled prune job (`/config/prune`).
pub static PRUNE_JOB: ResourceKind = ResourceKind {
    name: "prune-job",
    collection: "config/prune",
    id_field: "id",
    fields: PRUNE_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_job,
};

static SYNC_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("store").immutable(),
    FieldSpec::text("remote"),
    FieldSpec::text("remote-store"),
    FieldSpec::text("remote-ns"),
    FieldSpec::text("schedule"),
    FieldSpec::text("ns"),
    FieldSpec::integer("max-depth"),
    FieldSpec::list("group-filter"),
    FieldSpec::boolean("remove-vanished"),
    FieldSpec::boolean("resync-corrupt"),
    FieldSpec::boolean("encrypted-only"),
    FieldSpec::boolean("verified-only"),
    FieldSpec::boolean("run-on-mount"),
    FieldSpec::integer("transfer-last"),
    FieldSpec::text("sync-direction"),
    FieldSpec::text("owner"),
    FieldSpec::text("rate-in"),
    FieldSpec::text("rate-out"),
    FieldSpec::text("burst-in"),
    FieldSpec::text("burst-out"),
    FieldSpec::text("comment"),
];

/// Scheduled sync job pulling from (or pushing to) a remote (`/config/sync`).
pub static SYNC_JOB: ResourceKind = ResourceKind {
    name: "sync-job",
    collection: "config/sync",
    id_field: "id",
    fields: SYNC_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_sync_job,
};

static VERIFY_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("store").immutable(),
    FieldSpec::text("schedule"),
    FieldSpec::boolean("ignore-verified"),
    FieldSpec::integer("outdated-after"),
    FieldSpec::text("ns"),
    FieldSpec::integer("max-depth"),
    FieldSpec::text("comment"),
];

/// Scheduled verification job (`/config/verify`).
pub static VERIFY_JOB: ResourceKind = ResourceKind {
    name: "verify-job",
    collection: "config/verify",
    id_field: "id",
    fields: VERIFY_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_job,
};

fn validate_job(desired: &DesiredState) -> Result<()> {
    require("job", desired, "store")?;
    require("job", desired, "schedule")
}

fn validate_sync_job(desired: &DesiredState) -> Result<()> {
    validate_job(desired)?;
    require("sync-job", desired, "remote")?;
    require("sync-job", desired, "remote-store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Value;

    #[test]
    fn test_sync_job_requires_remote() {
        let desired = DesiredState::new("pull-offsite")
            .set("store", Value::text("store1"))
            .set("schedule", Value::text("hourly"));
        assert!(validate_sync_job(&desired).is_err());

        let desired = desired
            .set("remote", Value::text("offsite"))
            .set("remote-store", Value::text("backup"));
        assert!(validate_sync_job(&desired).is_ok());
    }

    #[test]
    fn test_store_is_immutable_on_every_job_kind() {
        for kind in [&PRUNE_JOB, &SYNC_JOB, &VERIFY_JOB] {
            assert!(kind.field("store").is_some_and(|f| f.immutable), "{}", kind.name);
        }
    }
}

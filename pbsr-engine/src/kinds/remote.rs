use crate::error::Result;
use crate::field::DesiredState;
use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, require};

static FIELDS: &[FieldSpec] = &[
    FieldSpec::text("host"),
    FieldSpec::integer("port"),
    FieldSpec::text("auth-id"),
    FieldSpec::text("password").write_only(),
    FieldSpec::text("fingerprint"),
    FieldSpec::text("comment"),
];

/// Remote backup server used as a sync source (`/config/remote`).
pub static REMOTE: ResourceKind = ResourceKind {
    name: "remote",
    collection: "config/remote",
    id_field: "name",
    fields: FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_remote,
};

fn validate_remote(desired: &DesiredState) -> Result<()> {
    require("remote", desired, "host")?;
    require("remote", desired, "auth-id")
}

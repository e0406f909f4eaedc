use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, no_validation};

static FIELDS: &[FieldSpec] = &[
    FieldSpec::text("endpoint"),
    FieldSpec::text("access-key"),
    FieldSpec::text("secret-key").write_only(),
    FieldSpec::text("region"),
    FieldSpec::text("fingerprint"),
    FieldSpec::integer("port"),
    FieldSpec::boolean("path-style"),
    FieldSpec::list("provider-quirks"),
    FieldSpec::integer("put-rate-limit"),
];

/// S3 endpoint used by s3-backed datastores (`/config/s3`).
pub static S3_ENDPOINT: ResourceKind = ResourceKind {
    name: "s3-endpoint",
    collection: "config/s3",
    id_field: "id",
    fields: FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: no_validation,
};

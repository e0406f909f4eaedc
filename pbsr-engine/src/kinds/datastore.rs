use crate::error::{Error, Result};
use crate::field::{DesiredState, Field, Value};
use crate::property::{Backend, BlockCodec, PropertyBlock};
use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, require};

static FIELDS: &[FieldSpec] = &[
    FieldSpec::text("path").immutable(),
    FieldSpec::block("backend", BlockCodec::Backend).immutable(),
    FieldSpec::text("backing-device").immutable(),
    FieldSpec::text("comment"),
    FieldSpec::boolean("disable"),
    FieldSpec::text("gc-schedule"),
    // Retired in favour of prune jobs; only accepted so validation can
    // point at the replacement.
    FieldSpec::text("prune-schedule"),
    FieldSpec::text("notify-user"),
    FieldSpec::text("notification-mode"),
    FieldSpec::block("notify", BlockCodec::Notify),
    FieldSpec::boolean("verify-new"),
    FieldSpec::block("tuning", BlockCodec::Tuning),
    FieldSpec::block("maintenance-mode", BlockCodec::MaintenanceMode),
];

/// Datastore configuration (`/config/datastore`).
///
/// Creating and removing a datastore runs as a server task and takes the
/// server's `.datastore.lck`, so all datastore mutations share one lock class.
pub static DATASTORE: ResourceKind = ResourceKind {
    name: "datastore",
    collection: "config/datastore",
    id_field: "name",
    fields: FIELDS,
    lock_class: Some("datastore"),
    task_backed: true,
    classify: classify_lock_contention,
    validate: validate_datastore,
};

fn validate_datastore(desired: &DesiredState) -> Result<()> {
    let fail = |msg: &str| Err(Error::Validation(format!("datastore '{}': {}", desired.id, msg)));

    require("datastore", desired, "path")?;

    if desired.get("prune-schedule").is_present() {
        return fail("prune-schedule is no longer supported on datastores, declare a prune-job instead");
    }

    let backend = match desired.get("backend") {
        Field::Present(Value::Block(props)) => Backend::from_properties(props)?,
        _ => Backend::default(),
    };
    let has_backing_device = matches!(
        desired.get("backing-device"),
        Field::Present(v) if !v.is_empty()
    );

    if backend.is_s3() && (backend.client.is_none() || backend.bucket.is_none()) {
        return fail("an s3 backend requires both client and bucket");
    }
    if backend.is_removable() && !has_backing_device {
        return fail("a removable backend requires backing-device");
    }
    if has_backing_device && !backend.is_removable() {
        return fail("backing-device is only valid with a removable backend");
    }

    Ok(())
}

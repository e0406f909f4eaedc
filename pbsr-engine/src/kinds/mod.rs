//! Built-in resource kinds.

mod datastore;
mod jobs;
mod metrics;
mod notifications;
mod remote;
mod s3_endpoint;

pub use datastore::DATASTORE;
pub use jobs::{PRUNE_JOB, SYNC_JOB, VERIFY_JOB};
pub use metrics::{METRICS_INFLUXDB_HTTP, METRICS_INFLUXDB_UDP};
pub use notifications::{GOTIFY_TARGET, MATCHER, SENDMAIL_TARGET, SMTP_TARGET, WEBHOOK_TARGET};
pub use remote::REMOTE;
pub use s3_endpoint::S3_ENDPOINT;

use crate::schema::ResourceKind;

/// Every built-in kind, in the order dependent resources should be created:
/// endpoints and remotes first, then notification targets, the matchers
/// routing to them, datastores and finally jobs.
pub static ALL: &[&ResourceKind] = &[
    &S3_ENDPOINT,
    &REMOTE,
    &SMTP_TARGET,
    &GOTIFY_TARGET,
    &SENDMAIL_TARGET,
    &WEBHOOK_TARGET,
    &MATCHER,
    &DATASTORE,
    &PRUNE_JOB,
    &SYNC_JOB,
    &VERIFY_JOB,
    &METRICS_INFLUXDB_HTTP,
    &METRICS_INFLUXDB_UDP,
];

/// Look up a built-in kind by its manifest name.
pub fn by_name(name: &str) -> Option<&'static ResourceKind> {
    ALL.iter().copied().find(|k| k.name == name)
}

/// Position of a kind in [`ALL`]; unknown kinds sort last.
pub fn creation_rank(name: &str) -> usize {
    ALL.iter().position(|k| k.name == name).unwrap_or(ALL.len())
}

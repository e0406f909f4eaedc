use crate::error::Result;
use crate::field::DesiredState;
use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, require};

static HTTP_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("url"),
    FieldSpec::boolean("enable"),
    FieldSpec::text("organization"),
    FieldSpec::text("bucket"),
    FieldSpec::text("token").write_only(),
    FieldSpec::integer("max-body-size"),
    FieldSpec::boolean("verify-tls"),
    FieldSpec::text("comment"),
];

/// InfluxDB HTTP metrics server (`/config/metrics/influxdb-http`).
pub static METRICS_INFLUXDB_HTTP: ResourceKind = ResourceKind {
    name: "metrics-influxdb-http",
    collection: "config/metrics/influxdb-http",
    id_field: "name",
    fields: HTTP_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_http,
};

static UDP_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("host"),
    FieldSpec::boolean("enable"),
    FieldSpec::integer("mtu"),
    FieldSpec::text("comment"),
];

/// InfluxDB UDP metrics server (`/config/metrics/influxdb-udp`).
pub static METRICS_INFLUXDB_UDP: ResourceKind = ResourceKind {
    name: "metrics-influxdb-udp",
    collection: "config/metrics/influxdb-udp",
    id_field: "name",
    fields: UDP_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_udp,
};

fn validate_http(desired: &DesiredState) -> Result<()> {
    require("metrics-influxdb-http", desired, "url")
}

fn validate_udp(desired: &DesiredState) -> Result<()> {
    // host is "<address>:<port>"
    require("metrics-influxdb-udp", desired, "host")
}

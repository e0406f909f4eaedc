//! Property strings: composite settings packed into one flat field
//! (`key=value,key2="quoted, value"`).
//!
//! [`parse_property_string`] and [`format_property_string`] are the raw codec.
//! The typed blocks ([`MaintenanceMode`], [`NotifySettings`], [`Tuning`],
//! [`Backend`]) define the canonical form of each composite field so that a
//! value read from the server and the same value written by a user compare
//! equal.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Parsed property string. Keys are lower-case; iteration order is the
/// canonical key order.
pub type PropertyMap = BTreeMap<String, String>;

/// Parse a property string into a map.
///
/// Commas separate entries, the first `=` separates key and value, double
/// quotes group a value and `\` escapes the next character inside quotes.
/// Unquoted values are trimmed; quoted values are kept verbatim.
pub fn parse_property_string(raw: &str) -> PropertyMap {
    let mut result = PropertyMap::new();
    let raw = raw.trim();
    if raw.is_empty() {
        return result;
    }

    let mut key = String::new();
    let mut value = String::new();
    let mut reading_key = true;
    let mut in_quotes = false;
    let mut quoted = false;
    let mut escaped = false;

    let mut flush = |key: &mut String, value: &mut String, reading_key: &mut bool, quoted: &mut bool| {
        let k = key.trim().to_lowercase();
        if !k.is_empty() {
            let v = if *quoted { value.clone() } else { value.trim().to_string() };
            result.insert(k, v);
        }
        key.clear();
        value.clear();
        *reading_key = true;
        *quoted = false;
    };

    for c in raw.chars() {
        if escaped {
            if reading_key {
                key.push(c);
            } else {
                value.push(c);
            }
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                if !reading_key && !in_quotes && !quoted {
                    // Whitespace before the opening quote is not part of the value.
                    if value.trim().is_empty() {
                        value.clear();
                    }
                    quoted = true;
                }
                in_quotes = !in_quotes;
            }
            '=' if !in_quotes && reading_key => reading_key = false,
            ',' if !in_quotes => flush(&mut key, &mut value, &mut reading_key, &mut quoted),
            c if !in_quotes && quoted && c.is_whitespace() => {}
            _ if reading_key => key.push(c),
            _ => value.push(c),
        }
    }
    flush(&mut key, &mut value, &mut reading_key, &mut quoted);

    result
}

/// Format a map as a property string: lexical key order, empty values
/// skipped. Values containing a comma, quote, backslash or whitespace are
/// quoted, with `\` and `"` escaped.
pub fn format_property_string(entries: &PropertyMap) -> String {
    entries
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| {
            if v.contains([',', '"', '\\']) || v.contains(char::is_whitespace) {
                format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// A composite settings block with a typed representation.
pub trait PropertyBlock: Sized {
    /// Build the typed block from parsed properties, validating values.
    fn from_properties(props: &PropertyMap) -> Result<Self>;

    /// Canonical properties of the block. Unset sub-fields are omitted.
    fn to_properties(&self) -> PropertyMap;

    fn parse(raw: &str) -> Result<Self> {
        Self::from_properties(&parse_property_string(raw))
    }

    fn format(&self) -> String {
        format_property_string(&self.to_properties())
    }
}

/// Which typed block a composite field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCodec {
    MaintenanceMode,
    Notify,
    Tuning,
    Backend,
}

impl BlockCodec {
    /// Canonicalize sub-fields by round-tripping through the typed block.
    pub fn canonicalize(&self, props: &PropertyMap) -> Result<PropertyMap> {
        match self {
            BlockCodec::MaintenanceMode => {
                MaintenanceMode::from_properties(props).map(|b| b.to_properties())
            }
            BlockCodec::Notify => NotifySettings::from_properties(props).map(|b| b.to_properties()),
            BlockCodec::Tuning => Tuning::from_properties(props).map(|b| b.to_properties()),
            BlockCodec::Backend => Backend::from_properties(props).map(|b| b.to_properties()),
        }
    }
}

fn reject_unknown(block: &str, props: &PropertyMap, known: &[&str]) -> Result<()> {
    if let Some(key) = props.keys().find(|k| !known.contains(&k.as_str())) {
        return Err(Error::Validation(format!(
            "unknown key '{}' in {} (expected one of: {})",
            key,
            block,
            known.join(", ")
        )));
    }
    Ok(())
}

fn non_empty(props: &PropertyMap, key: &str) -> Option<String> {
    props
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn lower(props: &PropertyMap, key: &str) -> Option<String> {
    non_empty(props, key).map(|v| v.to_lowercase())
}

fn one_of(block: &str, key: &str, value: Option<String>, allowed: &[&str]) -> Result<Option<String>> {
    match value {
        Some(v) if !allowed.contains(&v.as_str()) => Err(Error::Validation(format!(
            "invalid {} '{}' in {} (expected one of: {})",
            key,
            v,
            block,
            allowed.join(", ")
        ))),
        other => Ok(other),
    }
}

fn parse_int(block: &str, key: &str, props: &PropertyMap) -> Result<Option<i64>> {
    non_empty(props, key)
        .map(|v| {
            v.parse::<i64>().map_err(|_| {
                Error::Validation(format!("{} in {} must be an integer, got '{}'", key, block, v))
            })
        })
        .transpose()
}

/// Accepts 1/0, true/false, yes/no, on/off.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_flag(block: &str, key: &str, props: &PropertyMap) -> Result<Option<bool>> {
    non_empty(props, key)
        .map(|v| {
            parse_bool(&v).ok_or_else(|| {
                Error::Validation(format!("{} in {} must be a boolean, got '{}'", key, block, v))
            })
        })
        .transpose()
}

fn put(props: &mut PropertyMap, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        props.insert(key.to_string(), v.clone());
    }
}

// =============================================================================
// maintenance-mode
// =============================================================================

/// Datastore maintenance mode (`type=offline,message="..."`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceMode {
    pub mode: Option<String>,
    pub message: Option<String>,
}

impl PropertyBlock for MaintenanceMode {
    fn from_properties(props: &PropertyMap) -> Result<Self> {
        reject_unknown("maintenance-mode", props, &["type", "message"])?;
        Ok(Self {
            mode: one_of(
                "maintenance-mode",
                "type",
                lower(props, "type"),
                &["offline", "read-only", "unmount"],
            )?,
            message: non_empty(props, "message"),
        })
    }

    fn to_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        put(&mut props, "type", &self.mode);
        put(&mut props, "message", &self.message);
        props
    }
}

// =============================================================================
// notify
// =============================================================================

const NOTIFY_LEVELS: &[&str] = &["always", "error", "never"];

/// Per-job notification policy of a datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifySettings {
    pub gc: Option<String>,
    pub prune: Option<String>,
    pub sync: Option<String>,
    pub verify: Option<String>,
}

impl PropertyBlock for NotifySettings {
    fn from_properties(props: &PropertyMap) -> Result<Self> {
        reject_unknown("notify", props, &["gc", "prune", "sync", "verify"])?;
        let level = |key: &str| one_of("notify", key, lower(props, key), NOTIFY_LEVELS);
        Ok(Self {
            gc: level("gc")?,
            prune: level("prune")?,
            sync: level("sync")?,
            verify: level("verify")?,
        })
    }

    fn to_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        put(&mut props, "gc", &self.gc);
        put(&mut props, "prune", &self.prune);
        put(&mut props, "sync", &self.sync);
        put(&mut props, "verify", &self.verify);
        props
    }
}

// =============================================================================
// tuning
// =============================================================================

/// Advanced datastore tuning options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuning {
    pub chunk_order: Option<String>,
    pub gc_atime_cutoff: Option<i64>,
    pub gc_atime_safety_check: Option<bool>,
    pub gc_cache_capacity: Option<i64>,
    pub sync_level: Option<String>,
}

impl PropertyBlock for Tuning {
    fn from_properties(props: &PropertyMap) -> Result<Self> {
        reject_unknown(
            "tuning",
            props,
            &[
                "chunk-order",
                "gc-atime-cutoff",
                "gc-atime-safety-check",
                "gc-cache-capacity",
                "sync-level",
            ],
        )?;
        Ok(Self {
            chunk_order: one_of(
                "tuning",
                "chunk-order",
                lower(props, "chunk-order"),
                &["inode", "none"],
            )?,
            gc_atime_cutoff: parse_int("tuning", "gc-atime-cutoff", props)?,
            gc_atime_safety_check: parse_flag("tuning", "gc-atime-safety-check", props)?,
            gc_cache_capacity: parse_int("tuning", "gc-cache-capacity", props)?,
            sync_level: one_of(
                "tuning",
                "sync-level",
                lower(props, "sync-level"),
                &["none", "filesystem", "file"],
            )?,
        })
    }

    fn to_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        put(&mut props, "chunk-order", &self.chunk_order);
        put(
            &mut props,
            "gc-atime-cutoff",
            &self.gc_atime_cutoff.map(|v| v.to_string()),
        );
        put(
            &mut props,
            "gc-atime-safety-check",
            &self
                .gc_atime_safety_check
                .map(|v| (if v { "1" } else { "0" }).to_string()),
        );
        put(
            &mut props,
            "gc-cache-capacity",
            &self.gc_cache_capacity.map(|v| v.to_string()),
        );
        put(&mut props, "sync-level", &self.sync_level);
        props
    }
}

// =============================================================================
// backend
// =============================================================================

/// Datastore storage backend (`type=s3,client=<endpoint>,bucket=<name>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backend {
    pub backend_type: Option<String>,
    pub client: Option<String>,
    pub bucket: Option<String>,
}

impl Backend {
    pub fn is_s3(&self) -> bool {
        self.backend_type.as_deref() == Some("s3")
    }

    pub fn is_removable(&self) -> bool {
        self.backend_type.as_deref() == Some("removable")
    }
}

impl PropertyBlock for Backend {
    fn from_properties(props: &PropertyMap) -> Result<Self> {
        reject_unknown("backend", props, &["type", "client", "bucket"])?;
        Ok(Self {
            backend_type: one_of(
                "backend",
                "type",
                lower(props, "type"),
                &["filesystem", "s3", "removable"],
            )?,
            client: non_empty(props, "client"),
            bucket: non_empty(props, "bucket"),
        })
    }

    fn to_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        put(&mut props, "type", &self.backend_type);
        put(&mut props, "client", &self.client);
        put(&mut props, "bucket", &self.bucket);
        props
    }
}

//! Field values and the resource state shapes the diff engine works on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;
use crate::property::{PropertyMap, format_property_string};

/// An optional field with three distinguishable states.
///
/// In a desired state, `Absent` means "not mentioned" and `Null` means
/// "explicitly cleared"; both ask for the field to be unset. In a change
/// set, `Absent` means omitted, `Null` means delete and `Present` means
/// update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Field<T> {
    #[default]
    Absent,
    Null,
    Present(T),
}

impl<T> Field<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Field::Present(_))
    }

    /// Absent or Null.
    pub fn is_unset(&self) -> bool {
        !self.is_present()
    }

    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Field::Absent => Field::Absent,
            Field::Null => Field::Null,
            Field::Present(v) => Field::Present(v),
        }
    }

    pub fn present(self) -> Option<T> {
        match self {
            Field::Present(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Present(v),
            None => Field::Null,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
    /// Composite settings block, canonicalized by its schema codec.
    Block(PropertyMap),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Empty text, empty list and empty block carry no value.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Text(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Block(props) => props.is_empty(),
            Value::Boolean(_) | Value::Integer(_) => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::List(items) => write!(f, "[{}]", items.join(", ")),
            Value::Block(props) => write!(f, "{{{}}}", format_property_string(props)),
        }
    }
}

/// Fingerprints of write-only values, keyed by field name.
pub type Fingerprints = BTreeMap<String, String>;

/// SHA-256 fingerprint of a value, hex encoded.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Server-side state of one resource as produced by a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
    pub digest: Option<Digest>,
    /// Write-only values the server holds but never returns, as fingerprints
    /// of what was last sent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sent: Fingerprints,
}

impl ResourceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            digest: None,
            sent: Fingerprints::new(),
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Record that `value` was sent for a write-only field.
    pub fn with_sent(mut self, name: &str, value: &Value) -> Self {
        self.sent.insert(name.to_string(), fingerprint(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Whether the field holds a non-empty value.
    pub fn has_value(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|v| !v.is_empty())
    }
}

/// The caller's intended configuration of one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    pub id: String,
    pub fields: BTreeMap<String, Field<Value>>,
}

impl DesiredState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), Field::Present(value));
        self
    }

    pub fn clear(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string(), Field::Null);
        self
    }

    /// Three-state lookup; unknown names are `Absent`.
    pub fn get(&self, name: &str) -> Field<&Value> {
        self.fields
            .get(name)
            .map(Field::as_ref)
            .unwrap_or(Field::Absent)
    }

    /// Present values only.
    pub fn present(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().filter_map(|(k, v)| match v {
            Field::Present(value) => Some((k, value)),
            _ => None,
        })
    }
}

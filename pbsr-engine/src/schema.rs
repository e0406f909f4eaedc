//! Resource kind schemas.
//!
//! A [`ResourceKind`] describes one API collection as data: its fields, which
//! of them are immutable, which server-side lock class its mutations contend
//! on, and whether creates and deletes run as server tasks. The reconciler is
//! written once against this description.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::client::{RawResource, WireMap};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::field::{DesiredState, Field, Fingerprints, ResourceState, Value};
use crate::property::{BlockCodec, PropertyMap, format_property_string, parse_bool, parse_property_string};
use crate::retry::Classification;

/// Type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Boolean,
    List,
    /// Composite block, property-string encoded on the wire.
    Block(BlockCodec),
}

/// One field of a resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    /// Fixed at creation; a change requires replacing the resource.
    pub immutable: bool,
    /// Accepted on writes but never returned by reads (passwords, tokens).
    pub write_only: bool,
}

impl FieldSpec {
    pub const fn text(name: &'static str) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub const fn integer(name: &'static str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub const fn list(name: &'static str) -> Self {
        Self::new(name, FieldType::List)
    }

    pub const fn block(name: &'static str, codec: BlockCodec) -> Self {
        Self::new(name, FieldType::Block(codec))
    }

    const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            immutable: false,
            write_only: false,
        }
    }

    pub const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub const fn write_only(mut self) -> Self {
        self.write_only = true;
        self
    }

    /// Decode a JSON value into a typed value.
    ///
    /// Tolerates the server's loose encodings: booleans as `0`/`1`, numbers
    /// as strings, lists as comma-separated strings and blocks either as
    /// property strings or as JSON objects.
    pub fn decode(&self, raw: &Json) -> Result<Value> {
        let invalid = |expected: &str| {
            Error::Validation(format!(
                "field '{}' expects {}, got {}",
                self.name, expected, raw
            ))
        };

        match self.ty {
            FieldType::Text => match raw {
                Json::String(s) => Ok(Value::Text(s.clone())),
                Json::Number(n) => Ok(Value::Text(n.to_string())),
                Json::Bool(b) => Ok(Value::Text(b.to_string())),
                _ => Err(invalid("a string")),
            },
            FieldType::Integer => match raw {
                Json::Number(n) => n.as_i64().map(Value::Integer).ok_or_else(|| invalid("an integer")),
                Json::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|_| invalid("an integer")),
                _ => Err(invalid("an integer")),
            },
            FieldType::Boolean => match raw {
                Json::Bool(b) => Ok(Value::Boolean(*b)),
                Json::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Boolean(false)),
                    Some(1) => Ok(Value::Boolean(true)),
                    _ => Err(invalid("a boolean")),
                },
                Json::String(s) => parse_bool(s).map(Value::Boolean).ok_or_else(|| invalid("a boolean")),
                _ => Err(invalid("a boolean")),
            },
            FieldType::List => match raw {
                Json::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Json::String(s) => Ok(s.clone()),
                        _ => Err(invalid("a list of strings")),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Value::List),
                Json::String(s) => Ok(Value::List(
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                )),
                _ => Err(invalid("a list of strings")),
            },
            FieldType::Block(codec) => {
                let props = match raw {
                    Json::String(s) => parse_property_string(s),
                    Json::Object(map) => {
                        let mut props = PropertyMap::new();
                        for (key, value) in map {
                            let text = match value {
                                Json::Null => continue,
                                Json::String(s) => s.clone(),
                                Json::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
                                Json::Number(n) => n.to_string(),
                                _ => return Err(invalid("a settings block")),
                            };
                            props.insert(key.trim().to_lowercase(), text);
                        }
                        props
                    }
                    _ => return Err(invalid("a settings block")),
                };
                codec
                    .canonicalize(&props)
                    .map(Value::Block)
                    .map_err(|e| Error::Validation(format!("field '{}': {}", self.name, e)))
            }
        }
    }

    /// Encode a typed value for the wire.
    pub fn encode(&self, value: &Value) -> Json {
        match value {
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Text(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().cloned().map(Json::String).collect()),
            Value::Block(props) => Json::String(format_property_string(props)),
        }
    }
}

/// Declarative description of one resource kind.
#[derive(Debug, Clone, Copy)]
pub struct ResourceKind {
    /// Name used in manifests and state files (e.g. `datastore`).
    pub name: &'static str,
    /// API collection path below `/api2/json` (e.g. `config/datastore`).
    pub collection: &'static str,
    /// Wire name of the identifier field.
    pub id_field: &'static str,
    /// Fields in declaration order. The identifier is not listed.
    pub fields: &'static [FieldSpec],
    /// Server-side exclusive lock the kind's mutations contend on.
    pub lock_class: Option<&'static str>,
    /// Whether create and delete return a task handle.
    pub task_backed: bool,
    pub classify: fn(&Error) -> Classification,
    pub validate: fn(&DesiredState) -> Result<()>,
}

impl ResourceKind {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn immutable_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.immutable)
    }

    /// Build a desired state from a manifest field map.
    ///
    /// `null` marks a field as explicitly cleared. Unknown field names are
    /// rejected. Runs the kind's validation hook.
    pub fn desired_from_json(&self, id: &str, fields: &WireMap) -> Result<DesiredState> {
        if id.trim().is_empty() {
            return Err(Error::Validation(format!("{}: {} is required", self.name, self.id_field)));
        }

        let mut desired = DesiredState::new(id);
        for (name, raw) in fields {
            let spec = self.field(name).ok_or_else(|| self.unknown_field(id, name))?;
            let value = match raw {
                Json::Null => Field::Null,
                raw => Field::Present(spec.decode(raw)?),
            };
            desired.fields.insert(name.clone(), value);
        }

        self.check_desired(&desired)?;
        Ok(desired)
    }

    /// Reject unknown field names, then run the kind's validation hook.
    pub fn check_desired(&self, desired: &DesiredState) -> Result<()> {
        if let Some(name) = desired.fields.keys().find(|name| self.field(name).is_none()) {
            return Err(self.unknown_field(&desired.id, name));
        }
        (self.validate)(desired)
    }

    fn unknown_field(&self, id: &str, name: &str) -> Error {
        Error::Validation(format!("{} '{}': unknown field '{}'", self.name, id, name))
    }

    /// Decode a raw read into a resource state.
    ///
    /// Wire keys the schema does not know (the identifier, computed fields)
    /// are ignored; `null` values are treated as unset.
    pub fn decode_resource(&self, id: &str, raw: RawResource) -> Result<ResourceState> {
        let mut fields = BTreeMap::new();
        for spec in self.fields {
            match raw.fields.get(spec.name) {
                None | Some(Json::Null) => {}
                Some(value) => {
                    let decoded = spec.decode(value).map_err(|e| {
                        Error::Internal(format!("{} '{}' returned by server: {}", self.name, id, e))
                    })?;
                    fields.insert(spec.name.to_string(), decoded);
                }
            }
        }

        Ok(ResourceState {
            id: id.to_string(),
            fields,
            digest: raw.digest.filter(|d| !d.is_empty()).map(Digest::new),
            sent: Fingerprints::new(),
        })
    }

    /// Encode typed values for the wire.
    pub fn encode_fields<'a>(&self, values: impl IntoIterator<Item = (&'a String, &'a Value)>) -> WireMap {
        let mut map = WireMap::new();
        for (name, value) in values {
            let encoded = match self.field(name) {
                Some(spec) => spec.encode(value),
                None => Json::String(value.to_string()),
            };
            map.insert(name.clone(), encoded);
        }
        map
    }

    /// Wire body for a create: identifier plus the given values.
    pub fn create_body<'a>(&self, id: &str, values: impl IntoIterator<Item = (&'a String, &'a Value)>) -> WireMap {
        let mut map = self.encode_fields(values);
        map.insert(self.id_field.to_string(), Json::String(id.to_string()));
        map
    }
}

/// Validation hook for kinds without extra rules.
pub fn no_validation(_desired: &DesiredState) -> Result<()> {
    Ok(())
}

/// Require a field to carry a non-empty value.
pub fn require(kind: &str, desired: &DesiredState, name: &str) -> Result<()> {
    match desired.get(name) {
        Field::Present(value) if !value.is_empty() => Ok(()),
        _ => Err(Error::Validation(format!(
            "{} '{}': {} is required",
            kind, desired.id, name
        ))),
    }
}

//! Desired-state manifest.
//!
//! ```json
//! { "resources": [ { "kind": "datastore", "id": "store1", "fields": { "path": "/mnt/store1" } } ] }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use pbsr_engine::kinds;
use pbsr_engine::{DesiredState, ResourceKind, WireMap};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    resources: Vec<RawResourceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResourceEntry {
    kind: String,
    id: String,
    #[serde(default)]
    fields: WireMap,
}

/// One declared resource.
#[derive(Debug, Clone)]
pub struct ManifestResource {
    pub kind: &'static ResourceKind,
    pub desired: DesiredState,
}

impl ManifestResource {
    pub fn id(&self) -> &str {
        &self.desired.id
    }
}

/// Validated manifest, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub resources: Vec<ManifestResource>,
}

impl Manifest {
    /// Parse and validate manifest JSON.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(text).context("Invalid manifest JSON")?;

        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(raw.resources.len());
        for entry in raw.resources {
            let Some(kind) = kinds::by_name(&entry.kind) else {
                bail!("Unknown resource kind '{}' (resource '{}')", entry.kind, entry.id);
            };
            if !seen.insert((kind.name, entry.id.clone())) {
                bail!("Duplicate resource {} '{}'", kind.name, entry.id);
            }
            let desired = kind
                .desired_from_json(&entry.id, &entry.fields)
                .with_context(|| format!("Invalid {} '{}'", kind.name, entry.id))?;
            resources.push(ManifestResource { kind, desired });
        }

        Ok(Self { resources })
    }

    /// Read and parse a manifest file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to load manifest {}", path.display()))
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.resources
            .iter()
            .any(|r| r.kind.name == kind && r.desired.id == id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

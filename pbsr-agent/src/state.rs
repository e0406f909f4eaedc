//! Persisted agent state.
//!
//! The state file records which resources the agent manages, the digest
//! of the last successful read of each and fingerprints of the write-only
//! values last sent. It is the only place these survive between runs.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pbsr_engine::{Digest, Fingerprints, Outcome, ResourceKind, WireMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("state file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A resource owned by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub kind: String,
    pub id: String,
    pub digest: Option<Digest>,
    /// Server-side fields as of the last cycle, in wire form.
    #[serde(default)]
    pub fields: WireMap,
    /// Fingerprints of write-only values; the values themselves are never stored.
    #[serde(default, skip_serializing_if = "Fingerprints::is_empty")]
    pub sent: Fingerprints,
    pub updated_at: DateTime<Utc>,
}

/// Managed resources keyed by `kind/id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    resources: BTreeMap<String, ManagedResource>,
}

impl State {
    pub fn key(kind: &str, id: &str) -> String {
        format!("{}/{}", kind, id)
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&ManagedResource> {
        self.resources.get(&Self::key(kind, id))
    }

    pub fn digest(&self, kind: &str, id: &str) -> Option<&Digest> {
        self.get(kind, id).and_then(|r| r.digest.as_ref())
    }

    pub fn sent(&self, kind: &str, id: &str) -> Option<&Fingerprints> {
        self.get(kind, id).map(|r| &r.sent)
    }

    /// Record a managed resource.
    pub fn record(&mut self, kind: &str, id: &str, digest: Option<Digest>, fields: WireMap) {
        self.insert(kind, id, digest, fields, Fingerprints::new());
    }

    /// Record the result of a successful reconcile cycle.
    pub fn record_outcome(&mut self, kind: &ResourceKind, outcome: &Outcome) {
        self.insert(
            kind.name,
            &outcome.id,
            outcome.digest.clone(),
            kind.encode_fields(outcome.state.fields.iter()),
            outcome.state.sent.clone(),
        );
    }

    fn insert(&mut self, kind: &str, id: &str, digest: Option<Digest>, fields: WireMap, sent: Fingerprints) {
        self.resources.insert(
            Self::key(kind, id),
            ManagedResource {
                kind: kind.to_string(),
                id: id.to_string(),
                digest,
                fields,
                sent,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn remove(&mut self, kind: &str, id: &str) -> Option<ManagedResource> {
        self.resources.remove(&Self::key(kind, id))
    }

    pub fn resources(&self) -> impl Iterator<Item = &ManagedResource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Loads and saves [`State`] at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file is an empty state.
    pub async fn load(&self) -> Result<State, StateError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(State::default());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the state atomically: temp file in the same directory, then rename.
    pub async fn save(&self, state: &State) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&tmp, &json).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;

        debug!(path = %self.path.display(), resources = state.len(), "Saved state");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

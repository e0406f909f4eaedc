//! Optimistic locking: the server's opaque config digest.
//!
//! Every update and delete must carry the digest of the most recent
//! successful read. The server rejects a write whose digest is stale; the
//! engine surfaces that as [`Error::Conflict`] and never retries it in place.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::field::ResourceState;

/// Opaque version token returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Carries the last-known digest of one resource through a cycle.
///
/// Seeded with the caller's persisted digest, overwritten by every
/// successful read.
#[derive(Debug, Clone, Default)]
pub struct DigestCarrier {
    current: Option<Digest>,
}

impl DigestCarrier {
    pub fn new(persisted: Option<Digest>) -> Self {
        Self { current: persisted }
    }

    /// Record the digest of a successful read.
    pub fn observe(&mut self, state: &ResourceState) {
        if let (Some(previous), Some(fresh)) = (&self.current, &state.digest) {
            if previous != fresh {
                debug!(
                    id = %state.id,
                    persisted = %previous,
                    current = %fresh,
                    "Resource changed since the persisted digest was captured"
                );
            }
        }
        if state.digest.is_some() {
            self.current = state.digest.clone();
        }
    }

    /// Digest for an update or delete. Fails if no read has supplied one.
    pub fn for_write(&self, id: &str) -> Result<&Digest> {
        self.current.as_ref().ok_or_else(|| {
            Error::Validation(format!(
                "no digest known for '{}': read the resource before writing",
                id
            ))
        })
    }

    pub fn current(&self) -> Option<&Digest> {
        self.current.as_ref()
    }

    pub fn into_inner(self) -> Option<Digest> {
        self.current
    }
}

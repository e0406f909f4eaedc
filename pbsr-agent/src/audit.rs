//! Audit logging of mutations.
//!
//! Every event is logged locally via tracing (target `audit`). When a path
//! is configured it is also appended to a JSON-lines file. Write failures
//! are logged and otherwise ignored: auditing never fails a reconcile.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pbsr_engine::{Digest, Error};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    action: &'a str,
    kind: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Agent audit logger with domain-specific methods.
pub struct AgentAuditLogger {
    path: Option<PathBuf>,
    // Serializes appends so concurrent reconciles never interleave lines.
    write_lock: Mutex<()>,
}

impl AgentAuditLogger {
    /// Create an audit logger appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn log(
        &self,
        action: &str,
        kind: &str,
        id: &str,
        digest: Option<&Digest>,
        detail: Option<String>,
    ) {
        tracing::info!(
            target: "audit",
            action,
            kind,
            id,
            digest = digest.map(Digest::as_str),
            detail = detail.as_deref(),
            "{} {} '{}'",
            action,
            kind,
            id
        );

        let Some(path) = &self.path else {
            return;
        };

        let entry = AuditEntry {
            timestamp: Utc::now(),
            action,
            kind,
            id,
            digest: digest.map(Digest::as_str),
            detail,
        };
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode audit entry");
                return;
            }
        };
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Err(e) = append(path, &line).await {
            warn!(path = %path.display(), error = %e, "Failed to write audit log");
        }
    }

    // === Resource Events ===

    pub async fn resource_created(&self, kind: &str, id: &str, digest: Option<&Digest>) {
        self.log("created", kind, id, digest, None).await;
    }

    pub async fn resource_updated(
        &self,
        kind: &str,
        id: &str,
        updates: &[String],
        deletes: &[String],
        digest: Option<&Digest>,
    ) {
        let detail = format!("updated [{}] deleted [{}]", updates.join(","), deletes.join(","));
        self.log("updated", kind, id, digest, Some(detail)).await;
    }

    pub async fn resource_deleted(&self, kind: &str, id: &str, digest: Option<&Digest>) {
        self.log("deleted", kind, id, digest, None).await;
    }

    pub async fn replacement_required(&self, kind: &str, id: &str, fields: &[String]) {
        let detail = format!("immutable fields changed: {}", fields.join(","));
        self.log("replacement-required", kind, id, None, Some(detail)).await;
    }

    // === Failures ===

    pub async fn reconcile_failed(&self, kind: &str, id: &str, error: &Error) {
        let detail = match error.task_handle() {
            Some(handle) => format!("{} ({}, task {})", error, error.kind(), handle),
            None => format!("{} ({})", error, error.kind()),
        };
        self.log("failed", kind, id, None, Some(detail)).await;
    }
}

async fn append(path: &Path, line: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line).await?;
    file.flush().await
}

//! pbsr-agent: applies a declarative manifest to a Proxmox Backup Server.
//!
//! - Loads the desired resources from a JSON manifest ([`manifest`])
//! - Talks to the server's REST API ([`clients::HttpClient`])
//! - Drives one engine reconciler per resource, tier by tier ([`agent`])
//! - Persists digests and the set of managed resources between runs ([`state`])
//! - Records every mutation in an optional audit log ([`audit`])

pub mod agent;
pub mod audit;
pub mod clients;
pub mod manifest;
pub mod state;

pub use agent::{Agent, ApplyReport, Change, PlanReport, ResourceReport};
pub use audit::AgentAuditLogger;
pub use clients::{HttpClient, HttpClientConfig};
pub use manifest::{Manifest, ManifestResource};
pub use state::{ManagedResource, State, StateError, StateStore};

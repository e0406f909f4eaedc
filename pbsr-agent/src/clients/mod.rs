//! Clients for the backup server.
//!
//! - http: REST client for the `/api2/json` API, implementing the engine's
//!   `RemoteClient` contract

pub mod http;

pub use http::{HttpClient, HttpClientConfig};

//! REST client for the backup server API.
//!
//! Every response is wrapped in a `{ "data": ... }` envelope. Mutations that
//! run as server tasks answer with the task's UPID as a string `data`.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use pbsr_engine::{
    CreateOutcome, Digest, Error, RawResource, RemoteClient, ResourceKind, Result, TaskHandle,
    TaskStatus, WireMap,
};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL, e.g. `https://pbs.example.com:8007`.
    pub endpoint: String,
    /// API token in `user@realm!name:secret` form.
    pub api_token: String,
    /// Accept self-signed server certificates.
    pub insecure: bool,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: api_token.into(),
            insecure: false,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Json,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    node: String,
}

#[derive(Debug, Deserialize)]
struct ServerTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Json,
}

/// `RemoteClient` over the server's REST API.
pub struct HttpClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        if config.api_token.trim().is_empty() {
            bail!("An API token is required");
        }
        let base = Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid endpoint '{}'", config.endpoint))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            bail!("Endpoint '{}' must be an http(s) URL", config.endpoint);
        }

        let mut auth = HeaderValue::from_str(&format!("PBSAPIToken={}", config.api_token))
            .context("API token contains invalid characters")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, base })
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Internal(format!("endpoint {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(["api2", "json"])
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, kind: &ResourceKind) -> Result<Url> {
        self.url(kind.collection.split('/'))
    }

    fn resource_url(&self, kind: &ResourceKind, id: &str) -> Result<Url> {
        self.url(kind.collection.split('/').chain([id]))
    }

    /// Send a request and unwrap the `data` envelope.
    async fn send(&self, request: RequestBuilder) -> Result<Json> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::from_response(status.as_u16(), error_message(status, &body)));
        }
        if body.trim().is_empty() {
            return Ok(Json::Null);
        }

        let envelope: Envelope = serde_json::from_str(&body)
            .map_err(|e| Error::Internal(format!("malformed response: {}", e)))?;
        Ok(envelope.data)
    }

    async fn call(&self, method: Method, url: Url, body: Option<&WireMap>) -> Result<Json> {
        debug!(%method, %url, "API request");
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }
}

/// Extract the most useful message from an error response.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Json>(body) {
        let message = json.get("message").and_then(Json::as_str).map(str::trim);
        let errors = json.get("errors").filter(|e| !e.is_null());
        match (message, errors) {
            (Some(m), Some(e)) if !m.is_empty() => return format!("{} {}", m, e),
            (Some(m), None) if !m.is_empty() => return m.to_string(),
            (_, Some(e)) => return e.to_string(),
            _ => {}
        }
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    } else {
        body.to_string()
    }
}

/// A string `data` is a task handle; anything else means the call completed.
fn mutation_outcome(data: Json) -> CreateOutcome {
    match data {
        Json::String(upid) if !upid.trim().is_empty() => CreateOutcome::Task(TaskHandle::new(upid)),
        _ => CreateOutcome::Done,
    }
}

fn task_status(raw: ServerTaskStatus) -> TaskStatus {
    if raw.status != "stopped" {
        return TaskStatus::Running;
    }
    let exit = match raw.exitstatus {
        Json::String(s) => s,
        Json::Null => String::new(),
        other => other.to_string(),
    };
    match exit.trim() {
        "" | "OK" | "0" => TaskStatus::Succeeded,
        _ => TaskStatus::Failed(exit),
    }
}

#[async_trait]
impl RemoteClient for HttpClient {
    async fn read(&self, kind: &ResourceKind, id: &str) -> Result<RawResource> {
        let data = self
            .call(Method::GET, self.resource_url(kind, id)?, None)
            .await?;
        let mut fields = match data {
            Json::Object(fields) => fields,
            Json::Null => return Err(Error::NotFound(format!("{} '{}'", kind.name, id))),
            other => {
                return Err(Error::Internal(format!(
                    "{} '{}': expected an object, got {}",
                    kind.name, id, other
                )));
            }
        };
        let digest = match fields.remove("digest") {
            Some(Json::String(d)) => Some(d),
            _ => None,
        };
        Ok(RawResource { fields, digest })
    }

    async fn create(&self, kind: &ResourceKind, fields: &WireMap) -> Result<CreateOutcome> {
        let data = self
            .call(Method::POST, self.collection_url(kind)?, Some(fields))
            .await?;
        Ok(mutation_outcome(data))
    }

    async fn update(
        &self,
        kind: &ResourceKind,
        id: &str,
        updates: &WireMap,
        deletes: &[String],
        digest: &Digest,
    ) -> Result<()> {
        let mut body = updates.clone();
        if !deletes.is_empty() {
            body.insert(
                "delete".to_string(),
                Json::Array(deletes.iter().cloned().map(Json::String).collect()),
            );
        }
        body.insert("digest".to_string(), Json::String(digest.to_string()));

        self.call(Method::PUT, self.resource_url(kind, id)?, Some(&body))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: &ResourceKind,
        id: &str,
        digest: Option<&Digest>,
    ) -> Result<CreateOutcome> {
        let mut url = self.resource_url(kind, id)?;
        if let Some(digest) = digest {
            url.query_pairs_mut().append_pair("digest", digest.as_str());
        }
        let data = self.call(Method::DELETE, url, None).await?;
        Ok(mutation_outcome(data))
    }

    async fn task_status(&self, node: &str, handle: &TaskHandle) -> Result<TaskStatus> {
        let url = self.url(["nodes", node, "tasks", handle.as_str(), "status"])?;
        let data = self.call(Method::GET, url, None).await?;
        let raw: ServerTaskStatus = serde_json::from_value(data)
            .map_err(|e| Error::Internal(format!("malformed task status for {}: {}", handle, e)))?;
        Ok(task_status(raw))
    }

    async fn list_nodes(&self) -> Result<Vec<String>> {
        let data = self.call(Method::GET, self.url(["nodes"])?, None).await?;
        let nodes: Vec<NodeInfo> = serde_json::from_value(data)
            .map_err(|e| Error::Internal(format!("malformed node list: {}", e)))?;
        Ok(nodes.into_iter().map(|n| n.node).collect())
    }
}

//! Shared test utilities for pbsr-agent integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use pbsr_agent::{HttpClient, HttpClientConfig};
use pbsr_engine::kinds;
use pbsr_engine::{Backoff, ReconcileSettings, RetryPolicy, SettlePolicy, WireMap};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const TOKEN: &str = "root@pam!ci:secret";
pub const NODE: &str = "pbs";

type Reply = (StatusCode, Json<Value>);

/// One request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: &'static str,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Resources keyed by `collection/id`, e.g. `datastore/store1`.
    pub resources: HashMap<String, (WireMap, String)>,
    pub requests: Vec<Recorded>,
    /// Remaining creates to reject with a lock error.
    pub lock_failures: u32,
    /// Exit status of the next finished task (default `OK`).
    pub next_task_exit: Option<String>,
    /// Status polls each task reports `running` before it stops.
    pub running_polls: u32,
    tasks: HashMap<String, (u32, String)>,
    task_seq: u32,
}

type Shared = Arc<Mutex<MockState>>;

/// Minimal backup server API on 127.0.0.1 with an OS-assigned port.
pub struct MockPbs {
    pub addr: SocketAddr,
    state: Shared,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockPbs {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));

        let router = Router::new()
            .route("/api2/json/nodes", get(list_nodes))
            .route("/api2/json/nodes/{node}/tasks/{upid}/status", get(task_status))
            .route(
                "/api2/json/config/{*path}",
                get(read).post(create).put(update).delete(delete),
            )
            .with_state(state.clone());

        // Bind to port 0 to let the OS choose an available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> HttpClient {
        HttpClient::new(HttpClientConfig::new(self.endpoint(), TOKEN)).unwrap()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Store a resource directly. Returns its digest.
    pub fn insert(&self, key: &str, fields: Value) -> String {
        let digest = new_digest();
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.state()
            .resources
            .insert(key.to_string(), (fields, digest.clone()));
        digest
    }

    pub fn resource(&self, key: &str) -> Option<WireMap> {
        self.state().resources.get(key).map(|(f, _)| f.clone())
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state().requests.clone()
    }

    pub fn requests_with(&self, method: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }
}

impl Drop for MockPbs {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Engine settings with millisecond delays.
pub fn fast_settings() -> ReconcileSettings {
    ReconcileSettings {
        task_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        create_retry: RetryPolicy {
            backoff: Backoff::Linear(Duration::from_millis(10)),
            ..RetryPolicy::lock_contended()
        },
        settle: SettlePolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        },
    }
}

fn new_digest() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn error(status: StatusCode, message: &str) -> Reply {
    (status, Json(json!({ "data": null, "message": message })))
}

fn data(value: Value) -> Reply {
    (StatusCode::OK, Json(json!({ "data": value })))
}

fn authorize(headers: &HeaderMap) -> Result<(), Reply> {
    let expected = format!("PBSAPIToken={}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(error(StatusCode::UNAUTHORIZED, "authentication failed")),
    }
}

fn record(
    state: &mut MockState,
    method: &'static str,
    path: &str,
    query: HashMap<String, String>,
    body: Option<Value>,
) {
    state.requests.push(Recorded {
        method,
        path: path.to_string(),
        query,
        body,
    });
}

/// Task-backed collections answer mutations with a UPID.
fn start_task(state: &mut MockState, op: &str, collection: &str, id: &str) -> Value {
    if collection != "datastore" {
        return Value::Null;
    }
    state.task_seq += 1;
    let upid = format!(
        "UPID:{}:{:08X}:00000000:00000000:65000000:{}-{}:{}:root@pam:",
        NODE, state.task_seq, op, collection, id
    );
    let exit = state.next_task_exit.take().unwrap_or_else(|| "OK".to_string());
    state
        .tasks
        .insert(upid.clone(), (state.running_polls, exit));
    Value::String(upid)
}

/// Fields the real server accepts but never returns, for `collection/id`.
fn write_only_fields(path: &str) -> Vec<&'static str> {
    let collection = path.rsplit_once('/').map_or(path, |(c, _)| c);
    kinds::ALL
        .iter()
        .find(|k| k.collection.strip_prefix("config/") == Some(collection))
        .map(|k| k.fields.iter().filter(|f| f.write_only).map(|f| f.name).collect())
        .unwrap_or_default()
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_nodes(headers: HeaderMap, State(state): State<Shared>) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    record(&mut state.lock().unwrap(), "GET", "nodes", HashMap::new(), None);
    data(json!([{ "node": NODE, "status": "online" }]))
}

async fn task_status(
    headers: HeaderMap,
    State(state): State<Shared>,
    Path((node, upid)): Path<(String, String)>,
) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    let mut state = state.lock().unwrap();
    record(&mut state, "GET", &format!("nodes/{}/tasks/{}/status", node, upid), HashMap::new(), None);

    let Some((running, exit)) = state.tasks.get_mut(&upid) else {
        return error(StatusCode::NOT_FOUND, "no such task");
    };
    if *running > 0 {
        *running -= 1;
        return data(json!({ "status": "running", "upid": upid }));
    }
    data(json!({ "status": "stopped", "exitstatus": exit.clone(), "upid": upid }))
}

async fn read(
    headers: HeaderMap,
    State(state): State<Shared>,
    Path(path): Path<String>,
) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    let mut state = state.lock().unwrap();
    record(&mut state, "GET", &path, HashMap::new(), None);

    match state.resources.get(&path) {
        Some((fields, digest)) => {
            let mut body = fields.clone();
            for name in write_only_fields(&path) {
                body.remove(name);
            }
            body.insert("digest".to_string(), json!(digest));
            data(Value::Object(body))
        }
        None => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("{} does not exist", path),
        ),
    }
}

async fn create(
    headers: HeaderMap,
    State(state): State<Shared>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    let mut state = state.lock().unwrap();
    record(&mut state, "POST", &collection, HashMap::new(), Some(body.clone()));

    if state.lock_failures > 0 {
        state.lock_failures -= 1;
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unable to open lock - Unable to acquire lock \"/etc/proxmox-backup/.datastore.lck\" - Interrupted system call",
        );
    }

    let fields = body.as_object().cloned().unwrap_or_default();
    let id = fields
        .get("name")
        .or_else(|| fields.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let key = format!("{}/{}", collection, id);
    if state.resources.contains_key(&key) {
        return error(StatusCode::BAD_REQUEST, &format!("{} already exists", key));
    }

    state.resources.insert(key, (fields, new_digest()));
    let task = start_task(&mut state, "create", &collection, &id);
    data(task)
}

async fn update(
    headers: HeaderMap,
    State(state): State<Shared>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    let mut state = state.lock().unwrap();
    record(&mut state, "PUT", &path, HashMap::new(), Some(body.clone()));

    let mut updates = body.as_object().cloned().unwrap_or_default();
    let digest = updates.remove("digest");
    let deletes = updates.remove("delete");

    let Some((fields, current)) = state.resources.get_mut(&path) else {
        return error(StatusCode::INTERNAL_SERVER_ERROR, &format!("{} does not exist", path));
    };
    if let Some(digest) = digest {
        if digest.as_str() != Some(current.as_str()) {
            return error(
                StatusCode::BAD_REQUEST,
                "detected modified configuration - file changed by other user? Try again.",
            );
        }
    }

    for name in deletes.iter().filter_map(Value::as_array).flatten() {
        if let Some(name) = name.as_str() {
            fields.remove(name);
        }
    }
    fields.extend(updates);
    *current = new_digest();
    data(Value::Null)
}

async fn delete(
    headers: HeaderMap,
    State(state): State<Shared>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Reply {
    if let Err(reply) = authorize(&headers) {
        return reply;
    }
    let mut state = state.lock().unwrap();
    record(&mut state, "DELETE", &path, query.clone(), None);

    let Some((_, current)) = state.resources.get(&path) else {
        return error(StatusCode::INTERNAL_SERVER_ERROR, &format!("{} does not exist", path));
    };
    if let Some(digest) = query.get("digest") {
        if digest != current {
            return error(
                StatusCode::BAD_REQUEST,
                "detected modified configuration - file changed by other user? Try again.",
            );
        }
    }

    state.resources.remove(&path);
    let (collection, id) = path.rsplit_once('/').unwrap_or((path.as_str(), ""));
    let task = start_task(&mut state, "delete", collection, id);
    data(task)
}

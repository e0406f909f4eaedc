//! In-memory backup server implementing [`RemoteClient`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::client::{CreateOutcome, RawResource, RemoteClient, TaskStatus, WireMap};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::field::DesiredState;
use crate::schema::ResourceKind;
use crate::task::TaskHandle;

const DEFAULT_NODE: &str = "pbs";

/// Call counters and the last request bodies, for assertions.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub reads: u32,
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
    pub task_polls: u32,
    pub list_nodes: u32,
    /// Highest number of creates in flight at the same time.
    pub max_concurrent_creates: u32,
    pub last_create: Option<WireMap>,
    pub last_update: Option<(WireMap, Vec<String>)>,
    pub last_delete_digest: Option<Option<String>>,
    pub polled_nodes: Vec<String>,
}

#[derive(Debug, Clone)]
struct Stored {
    fields: WireMap,
    digest: String,
}

#[derive(Debug)]
struct Task {
    /// Polls answered with `Running` before the terminal status.
    running_polls: u32,
    outcome: Option<TaskStatus>,
}

#[derive(Debug)]
struct Inner {
    resources: HashMap<(String, String), Stored>,
    tasks: HashMap<String, Task>,
    hidden_reads: HashMap<String, u32>,
    hide_after_create: u32,
    create_failures: VecDeque<(u16, String)>,
    task_failures: VecDeque<String>,
    read_failure: Option<(u16, String)>,
    race_next_write: bool,
    task_running_polls: u32,
    tasks_never_finish: bool,
    unparsable_handles: bool,
    create_latency: Duration,
    creates_in_flight: u32,
    nodes: Vec<String>,
    task_seq: u32,
    calls: Calls,
}

/// In-memory [`RemoteClient`] with fault injection.
///
/// Lock classes, task-backed kinds and digests follow the [`ResourceKind`]
/// passed to each call, so the same client serves every kind.
#[derive(Debug)]
pub struct MemoryClient {
    inner: Mutex<Inner>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                resources: HashMap::new(),
                tasks: HashMap::new(),
                hidden_reads: HashMap::new(),
                hide_after_create: 0,
                create_failures: VecDeque::new(),
                task_failures: VecDeque::new(),
                read_failure: None,
                race_next_write: false,
                task_running_polls: 0,
                tasks_never_finish: false,
                unparsable_handles: false,
                create_latency: Duration::ZERO,
                creates_in_flight: 0,
                nodes: vec![DEFAULT_NODE.to_string()],
                task_seq: 0,
                calls: Calls::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    /// Store a resource directly, bypassing the API. Returns its digest.
    pub fn insert(&self, kind: &ResourceKind, desired: &DesiredState) -> Digest {
        let fields = kind.create_body(&desired.id, desired.present());
        let digest = new_digest();
        self.state().resources.insert(
            key(kind, &desired.id),
            Stored {
                fields,
                digest: digest.clone(),
            },
        );
        Digest::new(digest)
    }

    /// Raw wire fields of a stored resource.
    pub fn get(&self, kind: &ResourceKind, id: &str) -> Option<WireMap> {
        self.state()
            .resources
            .get(&key(kind, id))
            .map(|s| s.fields.clone())
    }

    pub fn contains(&self, kind: &ResourceKind, id: &str) -> bool {
        self.state().resources.contains_key(&key(kind, id))
    }

    pub fn digest(&self, kind: &ResourceKind, id: &str) -> Option<Digest> {
        self.state()
            .resources
            .get(&key(kind, id))
            .map(|s| Digest::new(s.digest.clone()))
    }

    /// Simulate another client editing the resource: set a field and
    /// change the digest.
    pub fn modify_externally(&self, kind: &ResourceKind, id: &str, field: &str, value: Json) {
        let mut state = self.state();
        if let Some(stored) = state.resources.get_mut(&key(kind, id)) {
            stored.fields.insert(field.to_string(), value);
            stored.digest = new_digest();
        }
    }

    pub fn calls(&self) -> Calls {
        self.state().calls.clone()
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next `count` create calls with the given response.
    pub fn fail_creates(&self, count: u32, status: u16, message: &str) {
        let mut state = self.state();
        for _ in 0..count {
            state.create_failures.push_back((status, message.to_string()));
        }
    }

    /// Make the next task started by a create or delete fail with `message`.
    pub fn fail_next_task(&self, message: &str) {
        self.state().task_failures.push_back(message.to_string());
    }

    /// Fail every read with the given response.
    pub fn fail_reads(&self, status: u16, message: &str) {
        self.state().read_failure = Some((status, message.to_string()));
    }

    /// Another client changes the resource just before the next update or
    /// delete reaches the server.
    pub fn race_next_write(&self) {
        self.state().race_next_write = true;
    }

    /// Tasks report `Running` this many times before finishing.
    pub fn set_task_running_polls(&self, polls: u32) {
        self.state().task_running_polls = polls;
    }

    /// Tasks never reach a terminal status.
    pub fn set_tasks_never_finish(&self, never: bool) {
        self.state().tasks_never_finish = never;
    }

    /// Hand out task handles without a node segment.
    pub fn set_unparsable_handles(&self, unparsable: bool) {
        self.state().unparsable_handles = unparsable;
    }

    /// The next `reads` reads of `id` report not found.
    pub fn hide_for_reads(&self, id: &str, reads: u32) {
        self.state().hidden_reads.insert(id.to_string(), reads);
    }

    /// After every create, hide the new resource for this many reads.
    pub fn set_hide_after_create(&self, reads: u32) {
        self.state().hide_after_create = reads;
    }

    /// Time each create call takes.
    pub fn set_create_latency(&self, latency: Duration) {
        self.state().create_latency = latency;
    }

    pub fn set_nodes(&self, nodes: &[&str]) {
        self.state().nodes = nodes.iter().map(|n| n.to_string()).collect();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn start_task(state: &mut Inner, op: &str, kind: &ResourceKind, id: &str) -> (TaskHandle, bool) {
        state.task_seq += 1;
        let node = state.nodes.first().cloned().unwrap_or_else(|| DEFAULT_NODE.to_string());
        let upid = if state.unparsable_handles {
            format!("task-{}", uuid::Uuid::new_v4().simple())
        } else {
            format!(
                "UPID:{}:{:08X}:{:08X}:{:08X}:{:08X}:{}-{}:{}:root@pam:",
                node,
                std::process::id(),
                state.task_seq * 7,
                state.task_seq,
                chrono::Utc::now().timestamp(),
                op,
                kind.name,
                id
            )
        };

        let failure = state.task_failures.pop_front();
        let succeeds = failure.is_none();
        let outcome = if state.tasks_never_finish {
            None
        } else {
            Some(match failure {
                Some(message) => TaskStatus::Failed(message),
                None => TaskStatus::Succeeded,
            })
        };
        state.tasks.insert(
            upid.clone(),
            Task {
                running_polls: state.task_running_polls,
                outcome,
            },
        );
        (TaskHandle::new(upid), succeeds)
    }
}

fn key(kind: &ResourceKind, id: &str) -> (String, String) {
    (kind.name.to_string(), id.to_string())
}

fn new_digest() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn not_found(kind: &ResourceKind, id: &str) -> Error {
    Error::from_response(404, format!("{} '{}' does not exist", kind.name, id))
}

#[async_trait]
impl RemoteClient for MemoryClient {
    async fn read(&self, kind: &ResourceKind, id: &str) -> Result<RawResource> {
        let mut state = self.state();
        state.calls.reads += 1;

        if let Some((status, message)) = &state.read_failure {
            return Err(Error::from_response(*status, message.clone()));
        }
        if let Some(remaining) = state.hidden_reads.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(not_found(kind, id));
            }
        }

        let stored = state
            .resources
            .get(&key(kind, id))
            .ok_or_else(|| not_found(kind, id))?;
        // Like the server, never hand write-only values back.
        let fields = stored
            .fields
            .iter()
            .filter(|(name, _)| !kind.field(name).is_some_and(|f| f.write_only))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(RawResource {
            fields,
            digest: Some(stored.digest.clone()),
        })
    }

    async fn create(&self, kind: &ResourceKind, fields: &WireMap) -> Result<CreateOutcome> {
        let latency = {
            let mut state = self.state();
            state.calls.creates += 1;
            state.calls.last_create = Some(fields.clone());
            state.creates_in_flight += 1;
            state.calls.max_concurrent_creates =
                state.calls.max_concurrent_creates.max(state.creates_in_flight);
            state.create_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.creates_in_flight -= 1;

        if let Some((status, message)) = state.create_failures.pop_front() {
            return Err(Error::from_response(status, message));
        }

        let id = fields
            .get(kind.id_field)
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::from_response(400, format!("{} is required", kind.id_field)))?;
        if state.resources.contains_key(&key(kind, &id)) {
            return Err(Error::from_response(
                400,
                format!("{} '{}' already exists", kind.name, id),
            ));
        }

        let (outcome, succeeds) = if kind.task_backed {
            let (handle, succeeds) = Self::start_task(&mut state, "create", kind, &id);
            (CreateOutcome::Task(handle), succeeds)
        } else {
            (CreateOutcome::Done, true)
        };

        if succeeds {
            state.resources.insert(
                key(kind, &id),
                Stored {
                    fields: fields.clone(),
                    digest: new_digest(),
                },
            );
            if state.hide_after_create > 0 {
                let hide = state.hide_after_create;
                state.hidden_reads.insert(id, hide);
            }
        }
        Ok(outcome)
    }

    async fn update(
        &self,
        kind: &ResourceKind,
        id: &str,
        updates: &WireMap,
        deletes: &[String],
        digest: &Digest,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.updates += 1;
        state.calls.last_update = Some((updates.clone(), deletes.to_vec()));
        let raced = std::mem::take(&mut state.race_next_write);

        let stored = state
            .resources
            .get_mut(&key(kind, id))
            .ok_or_else(|| not_found(kind, id))?;
        if raced {
            stored.digest = new_digest();
        }
        if stored.digest != digest.as_str() {
            return Err(Error::from_response(
                400,
                "detected modified configuration - file changed by other user? Try again.",
            ));
        }

        for name in deletes {
            stored.fields.remove(name);
        }
        for (name, value) in updates {
            stored.fields.insert(name.clone(), value.clone());
        }
        stored.digest = new_digest();
        Ok(())
    }

    async fn delete(
        &self,
        kind: &ResourceKind,
        id: &str,
        digest: Option<&Digest>,
    ) -> Result<CreateOutcome> {
        let mut state = self.state();
        state.calls.deletes += 1;
        state.calls.last_delete_digest = Some(digest.map(|d| d.as_str().to_string()));
        let raced = std::mem::take(&mut state.race_next_write);

        let stored = state
            .resources
            .get_mut(&key(kind, id))
            .ok_or_else(|| not_found(kind, id))?;
        if raced {
            stored.digest = new_digest();
        }
        if let Some(digest) = digest {
            if stored.digest != digest.as_str() {
                return Err(Error::from_response(
                    400,
                    "detected modified configuration - file changed by other user? Try again.",
                ));
            }
        }

        if kind.task_backed {
            let (handle, succeeds) = Self::start_task(&mut state, "delete", kind, id);
            if succeeds {
                state.resources.remove(&key(kind, id));
            }
            Ok(CreateOutcome::Task(handle))
        } else {
            state.resources.remove(&key(kind, id));
            Ok(CreateOutcome::Done)
        }
    }

    async fn task_status(&self, node: &str, handle: &TaskHandle) -> Result<TaskStatus> {
        let mut state = self.state();
        state.calls.task_polls += 1;
        state.calls.polled_nodes.push(node.to_string());

        let task = state
            .tasks
            .get_mut(handle.as_str())
            .ok_or_else(|| Error::from_response(404, format!("task {} not found", handle)))?;

        if task.running_polls > 0 {
            task.running_polls -= 1;
            return Ok(TaskStatus::Running);
        }
        Ok(task.outcome.clone().unwrap_or(TaskStatus::Running))
    }

    async fn list_nodes(&self) -> Result<Vec<String>> {
        let mut state = self.state();
        state.calls.list_nodes += 1;
        Ok(state.nodes.clone())
    }
}

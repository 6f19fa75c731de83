//! Wait/notify: callbacks that fire once every id they wait on is done.
//!
//! A wait is a callback plus the set of ids it still needs. `done_with`
//! satisfies an id for every wait registered on it; the wait whose last id
//! is satisfied pushes exactly one [`EngineEvent::Callback`] onto the work
//! queue. Responses that arrive before the wait is registered are kept for
//! a retention window, so a fast child finishing ahead of its parent's
//! bookkeeping is never lost.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use arbor_types::{ArborError, FailureInfo, Result, Status};

/// What to do once a wait is satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyCallback {
    /// Resume the node through its step handler.
    EngineResume { node_execution_id: String },
    /// One child of a bounded fan-out finished; admit the next one.
    MaxConcurrentChild {
        parent_node_execution_id: String,
        proceed_if_failed: bool,
    },
    /// Input arrived for a node parked in INPUT_WAITING.
    ExecutionInput {
        node_execution_id: String,
        input_instance_id: String,
    },
}

/// Payload delivered for one satisfied id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseData {
    Status {
        node_execution_id: String,
        status: Status,
        #[serde(default)]
        failure_info: Option<FailureInfo>,
    },
    Payload {
        value: serde_json::Value,
    },
    Error {
        message: String,
    },
    ExecutionInput {
        input_instance_id: String,
    },
}

/// Unit of work for an engine worker.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StartNode {
        node_execution_id: String,
    },
    Callback {
        callback: NotifyCallback,
        responses: BTreeMap<String, ResponseData>,
    },
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl WorkQueue {
    pub fn channel() -> (WorkQueue, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (WorkQueue { sender }, receiver)
    }

    pub fn push(&self, event: EngineEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| ArborError::Other("engine work queue is closed".into()))
    }
}

// ---------------------------------------------------------------------------
// WaitNotifyEngine
// ---------------------------------------------------------------------------

/// How long a satisfied id is remembered for waits registered after it.
pub const DEFAULT_DONE_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingWait {
    callback: NotifyCallback,
    pending: BTreeSet<String>,
    responses: BTreeMap<String, ResponseData>,
}

#[derive(Debug)]
struct DoneEntry {
    response: ResponseData,
    at: Instant,
}

#[derive(Debug)]
struct WaitState {
    waits: HashMap<String, PendingWait>,
    /// callback id -> waits still missing it
    index: HashMap<String, Vec<String>>,
    done: HashMap<String, DoneEntry>,
    last_prune: Instant,
}

impl Default for WaitState {
    fn default() -> Self {
        Self {
            waits: HashMap::new(),
            index: HashMap::new(),
            done: HashMap::new(),
            last_prune: Instant::now(),
        }
    }
}

impl WaitState {
    fn index_wait(&mut self, wait_id: &str, wait: &PendingWait) {
        for id in &wait.pending {
            self.index
                .entry(id.clone())
                .or_default()
                .push(wait_id.to_string());
        }
    }

    /// Forget satisfied ids older than `retention`. Runs at most once per
    /// half window.
    fn prune(&mut self, retention: Duration) {
        if self.last_prune.elapsed() < retention / 2 {
            return;
        }
        let before = self.done.len();
        self.done.retain(|_, entry| entry.at.elapsed() < retention);
        self.last_prune = Instant::now();
        let pruned = before - self.done.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.done.len(), "Pruned satisfied callback ids");
        }
    }
}

/// Serialisable copy of the waits still outstanding and the satisfied ids
/// nobody has consumed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitSnapshot {
    #[serde(default)]
    waits: BTreeMap<String, PendingWait>,
    #[serde(default)]
    done: BTreeMap<String, ResponseData>,
}

impl WaitSnapshot {
    pub fn pending_waits(&self) -> usize {
        self.waits.len()
    }
}

pub struct WaitNotifyEngine {
    state: Mutex<WaitState>,
    queue: WorkQueue,
    retention: Duration,
}

impl WaitNotifyEngine {
    pub fn new(queue: WorkQueue) -> Self {
        Self::with_retention(queue, DEFAULT_DONE_RETENTION)
    }

    pub fn with_retention(queue: WorkQueue, retention: Duration) -> Self {
        Self {
            state: Mutex::new(WaitState::default()),
            queue,
            retention,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register `callback` to fire once every id in `ids` is done. Returns
    /// the wait id.
    pub fn wait_for_all_on(&self, callback: NotifyCallback, ids: Vec<String>) -> Result<String> {
        let wait_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.lock();

        let mut wait = PendingWait {
            callback,
            pending: BTreeSet::new(),
            responses: BTreeMap::new(),
        };
        for id in ids {
            match state.done.get(&id) {
                Some(entry) => {
                    wait.responses.insert(id, entry.response.clone());
                }
                None => {
                    wait.pending.insert(id);
                }
            }
        }

        if wait.pending.is_empty() {
            tracing::debug!(wait = %wait_id, "Wait satisfied on registration");
            return self
                .queue
                .push(EngineEvent::Callback {
                    callback: wait.callback,
                    responses: wait.responses,
                })
                .map(|_| wait_id);
        }

        state.index_wait(&wait_id, &wait);
        tracing::debug!(wait = %wait_id, pending = wait.pending.len(), "Wait registered");
        state.waits.insert(wait_id.clone(), wait);
        Ok(wait_id)
    }

    /// Satisfy `id`. A second call for the same id is ignored.
    pub fn done_with(&self, id: &str, response: ResponseData) -> Result<()> {
        let mut state = self.lock();
        if state.done.contains_key(id) {
            tracing::debug!(callback = %id, "Duplicate notify ignored");
            return Ok(());
        }
        state.prune(self.retention);
        state.done.insert(
            id.to_string(),
            DoneEntry {
                response: response.clone(),
                at: Instant::now(),
            },
        );

        let wait_ids = state.index.remove(id).unwrap_or_default();
        for wait_id in wait_ids {
            let Some(wait) = state.waits.get_mut(&wait_id) else {
                continue;
            };
            wait.pending.remove(id);
            wait.responses.insert(id.to_string(), response.clone());
            if !wait.pending.is_empty() {
                continue;
            }
            if let Some(wait) = state.waits.remove(&wait_id) {
                tracing::debug!(wait = %wait_id, callback = %id, "Wait satisfied");
                self.queue.push(EngineEvent::Callback {
                    callback: wait.callback,
                    responses: wait.responses,
                })?;
            }
        }
        Ok(())
    }

    pub fn done_with_error(&self, id: &str, message: impl Into<String>) -> Result<()> {
        self.done_with(
            id,
            ResponseData::Error {
                message: message.into(),
            },
        )
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.lock().done.contains_key(id)
    }

    /// Waits registered and not yet fired.
    pub fn pending_waits(&self) -> usize {
        self.lock().waits.len()
    }

    pub fn snapshot(&self) -> WaitSnapshot {
        let state = self.lock();
        WaitSnapshot {
            waits: state
                .waits
                .iter()
                .map(|(id, wait)| (id.clone(), wait.clone()))
                .collect(),
            done: state
                .done
                .iter()
                .map(|(id, entry)| (id.clone(), entry.response.clone()))
                .collect(),
        }
    }

    /// Load waits from a snapshot. Restored satisfied ids start a fresh
    /// retention window.
    pub fn restore(&self, snapshot: WaitSnapshot) {
        let mut state = self.lock();
        let now = Instant::now();
        for (id, response) in snapshot.done {
            state.done.insert(id, DoneEntry { response, at: now });
        }
        for (wait_id, wait) in snapshot.waits {
            state.index_wait(&wait_id, &wait);
            state.waits.insert(wait_id, wait);
        }
        tracing::debug!(waits = state.waits.len(), done = state.done.len(), "Waits restored");
    }
}

//! Task registry: per-task status, results and the event sink
//!
//! Every state change goes through [`Registry::transition`] so that status
//! snapshots and `StateChanged` events never disagree. The registry also
//! tracks which task owns each destination path, so two tasks never stage
//! the same file at once.

use crate::error::{Error, Result};
use crate::types::{Event, LifecycleState, TaskId, TaskResult, TaskStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; slow subscribers see `Lagged` beyond this
const EVENT_CHANNEL_CAPACITY: usize = 1000;

struct TaskEntry {
    status: TaskStatus,
    cancel: CancellationToken,
    result: Option<TaskResult>,
}

#[derive(Default)]
struct Tasks {
    entries: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
}

pub(crate) struct Registry {
    tasks: RwLock<Tasks>,
    event_tx: broadcast::Sender<Event>,
    // Bumped whenever a task reaches a terminal state
    finished_tx: watch::Sender<u64>,
    // Destination -> owning task, for tasks between planning and their terminal state
    claims: RwLock<HashMap<PathBuf, TaskId>>,
    // Bumped whenever claims are released
    released_tx: watch::Sender<u64>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (finished_tx, _rx) = watch::channel(0);
        let (released_tx, _rx) = watch::channel(0);
        Self {
            tasks: RwLock::new(Tasks::default()),
            event_tx,
            finished_tx,
            claims: RwLock::new(HashMap::new()),
            released_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }

    /// Sender handle for emitting from synchronous callbacks
    pub(crate) fn event_sender(&self) -> broadcast::Sender<Event> {
        self.event_tx.clone()
    }

    pub(crate) async fn insert(&self, status: TaskStatus, cancel: CancellationToken) {
        let id = status.id;
        let mut tasks = self.tasks.write().await;
        tasks.entries.insert(
            id,
            TaskEntry {
                status,
                cancel,
                result: None,
            },
        );
        tasks.order.push(id);
    }

    /// Move a task to `to`, emitting `StateChanged` if the state differs
    ///
    /// Returns the previous state, or `None` for an unknown task.
    pub(crate) async fn transition(&self, id: TaskId, to: LifecycleState) -> Option<LifecycleState> {
        let from = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks.entries.get_mut(&id)?;
            let from = entry.status.state;
            entry.status.state = to;
            if to.is_terminal() {
                entry.status.finished_at = Some(Utc::now());
            }
            from
        };

        if from != to {
            tracing::debug!(task_id = id.get(), %from, %to, "state changed");
            self.emit(Event::StateChanged { id, from, to });
        }
        Some(from)
    }

    pub(crate) async fn update<F>(&self, id: TaskId, apply: F)
    where
        F: FnOnce(&mut TaskStatus),
    {
        let mut tasks = self.tasks.write().await;
        if let Some(entry) = tasks.entries.get_mut(&id) {
            apply(&mut entry.status);
        }
    }

    /// Record the terminal result and wake waiters
    pub(crate) async fn finish(&self, result: TaskResult) {
        {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.entries.get_mut(&result.id) {
                entry.status.quality = result.quality;
                entry.result = Some(result);
            }
        }
        self.finished_tx.send_modify(|count| *count += 1);
    }

    pub(crate) async fn state(&self, id: TaskId) -> Option<LifecycleState> {
        let tasks = self.tasks.read().await;
        tasks.entries.get(&id).map(|entry| entry.status.state)
    }

    pub(crate) async fn status(&self, id: TaskId) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks.entries.get(&id).map(|entry| entry.status.clone())
    }

    pub(crate) async fn statuses(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks
            .order
            .iter()
            .filter_map(|id| tasks.entries.get(id))
            .map(|entry| entry.status.clone())
            .collect()
    }

    pub(crate) async fn cancel_token(&self, id: TaskId) -> Option<CancellationToken> {
        let tasks = self.tasks.read().await;
        tasks.entries.get(&id).map(|entry| entry.cancel.clone())
    }

    /// Terminal results in submission order
    pub(crate) async fn results(&self) -> Vec<TaskResult> {
        let tasks = self.tasks.read().await;
        tasks
            .order
            .iter()
            .filter_map(|id| tasks.entries.get(id))
            .filter_map(|entry| entry.result.clone())
            .collect()
    }

    /// Wait for a task's result; `None` if the task is unknown
    pub(crate) async fn wait(&self, id: TaskId) -> Option<TaskResult> {
        // Subscribe before checking so a finish in between is not missed
        let mut finished = self.finished_tx.subscribe();
        loop {
            {
                let tasks = self.tasks.read().await;
                let entry = tasks.entries.get(&id)?;
                if let Some(result) = &entry.result {
                    return Some(result.clone());
                }
            }
            if finished.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Claim `path` for `id` unless another task owns it
    pub(crate) async fn try_claim(&self, id: TaskId, path: &Path) -> bool {
        let mut claims = self.claims.write().await;
        match claims.get(path) {
            Some(owner) if *owner != id => false,
            _ => {
                claims.insert(path.to_path_buf(), id);
                true
            }
        }
    }

    /// Claim `path` for `id`, waiting for the current owner to release it
    pub(crate) async fn claim(
        &self,
        id: TaskId,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Subscribe before trying so a release in between is not missed
        let mut released = self.released_tx.subscribe();
        loop {
            if self.try_claim(id, path).await {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = released.changed() => changed.map_err(|_| Error::ShuttingDown)?,
            }
        }
    }

    /// Release every destination owned by `id`
    pub(crate) async fn release_claims(&self, id: TaskId) {
        let released = {
            let mut claims = self.claims.write().await;
            let before = claims.len();
            claims.retain(|_, owner| *owner != id);
            claims.len() != before
        };
        if released {
            self.released_tx.send_modify(|count| *count += 1);
        }
    }
}

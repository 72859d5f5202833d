//! In-memory task records with compare-and-swap status transitions.
//!
//! One coarse `RwLock` guards the map. No method holds it across an await;
//! waiting for completion goes through a per-task `watch` channel instead.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use warden_core::{
    RunPhase, TaskError, TaskId, TaskOutput, TaskPayload, TaskRecord, TaskStatus, WardenError,
    WorkerId,
};

/// Fields written together with a status change.
#[derive(Debug, Default)]
pub struct TransitionFields {
    /// Owner; required when entering `Running`.
    pub worker: Option<WorkerId>,
    /// Required when entering `Succeeded`.
    pub result: Option<TaskOutput>,
    /// Required when entering `Failed`.
    pub error: Option<TaskError>,
}

impl TransitionFields {
    /// Claim by `worker`.
    pub fn running(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            ..Self::default()
        }
    }

    /// Success with `output`.
    pub fn succeeded(output: TaskOutput) -> Self {
        Self {
            result: Some(output),
            ..Self::default()
        }
    }

    /// Failure with `error`.
    pub fn failed(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Waiting for a worker.
    pub pending: usize,
    /// Owned by a worker.
    pub running: usize,
    /// Finished with a result.
    pub succeeded: usize,
    /// Finished with an error.
    pub failed: usize,
}

impl StatusCounts {
    /// All tasks.
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }
}

struct Entry {
    record: TaskRecord,
    status_tx: watch::Sender<TaskStatus>,
}

/// Source of truth for task progress and results.
///
/// Constructed and injected, never global: several stores (and executors)
/// can live in one process.
///
/// # Examples
///
/// ```
/// use warden_core::{TaskPayload, TaskStatus, WorkerId};
/// use warden_queue::{TaskStore, TransitionFields};
///
/// let store = TaskStore::new();
/// let payload = TaskPayload {
///     repo: "github:acme/api".parse().unwrap(),
///     range: "main..feature".parse().unwrap(),
///     params: Default::default(),
/// };
/// let id = store.create(payload);
/// store
///     .transition(id, TaskStatus::Pending, TaskStatus::Running, TransitionFields::running(WorkerId(0)))
///     .unwrap();
///
/// // a second claim loses the race
/// let err = store
///     .transition(id, TaskStatus::Pending, TaskStatus::Running, TransitionFields::running(WorkerId(1)))
///     .unwrap_err();
/// assert!(matches!(err, warden_core::WardenError::Conflict { .. }));
/// ```
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Entry>>,
}

impl TaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a `Pending` task under a fresh id.
    pub fn create(&self, payload: TaskPayload) -> TaskId {
        let mut tasks = self.write();
        let mut id = TaskId::new();
        while tasks.contains_key(&id) {
            id = TaskId::new();
        }
        tasks.insert(id, Entry::new(TaskRecord::new(id, payload)));
        id
    }

    /// Insert a `Pending` task under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::DuplicateTask`] if `id` is taken.
    pub fn create_with_id(&self, id: TaskId, payload: TaskPayload) -> Result<(), WardenError> {
        let mut tasks = self.write();
        if tasks.contains_key(&id) {
            return Err(WardenError::DuplicateTask(id));
        }
        tasks.insert(id, Entry::new(TaskRecord::new(id, payload)));
        Ok(())
    }

    /// Snapshot of a task.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::TaskNotFound`] for unknown or purged ids.
    pub fn get(&self, id: TaskId) -> Result<TaskRecord, WardenError> {
        self.read()
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or(WardenError::TaskNotFound(id))
    }

    /// Compare-and-swap the status of `id` from `from` to `to`, writing
    /// `fields` in the same critical section. Returns the updated record.
    ///
    /// Entering a terminal status clears the run phase and wakes
    /// [`wait_for_terminal`](Self::wait_for_terminal) callers.
    ///
    /// # Errors
    ///
    /// - [`WardenError::InvalidTransition`] if `from -> to` is not an edge of
    ///   the state machine or `fields` do not fit `to`
    /// - [`WardenError::Conflict`] if the stored status is not `from`
    /// - [`WardenError::TaskNotFound`] for unknown ids
    pub fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<TaskRecord, WardenError> {
        if !from.can_transition_to(to) {
            return Err(invalid(from, to, "not an edge of the task state machine"));
        }
        match to {
            TaskStatus::Running if fields.worker.is_none() => {
                return Err(invalid(from, to, "a running task needs an owning worker"));
            }
            TaskStatus::Succeeded if fields.result.is_none() || fields.error.is_some() => {
                return Err(invalid(from, to, "success requires a result and no error"));
            }
            TaskStatus::Failed if fields.error.is_none() || fields.result.is_some() => {
                return Err(invalid(from, to, "failure requires an error and no result"));
            }
            _ => {}
        }

        let mut tasks = self.write();
        let entry = tasks.get_mut(&id).ok_or(WardenError::TaskNotFound(id))?;
        if entry.record.status != from {
            return Err(WardenError::Conflict {
                id,
                expected: from,
                actual: entry.record.status,
            });
        }

        let record = &mut entry.record;
        record.status = to;
        record.updated_at = Utc::now();
        record.phase = None;
        if let Some(worker) = fields.worker {
            record.worker = Some(worker);
        }
        record.result = fields.result;
        record.error = fields.error;

        entry.status_tx.send_replace(to);
        Ok(entry.record.clone())
    }

    /// Count one scheduled retry and set the `Retrying` phase. Returns the
    /// new retry count.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Conflict`] unless the task is `Running`.
    pub fn record_retry(&self, id: TaskId, phase: RunPhase) -> Result<u32, WardenError> {
        self.update_running(id, |record| {
            record.retry_count += 1;
            record.phase = Some(phase);
            record.retry_count
        })
    }

    /// Replace the run phase of a `Running` task.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Conflict`] unless the task is `Running`.
    pub fn set_phase(&self, id: TaskId, phase: RunPhase) -> Result<(), WardenError> {
        self.update_running(id, |record| record.phase = Some(phase))
    }

    fn update_running<R>(
        &self,
        id: TaskId,
        apply: impl FnOnce(&mut TaskRecord) -> R,
    ) -> Result<R, WardenError> {
        let mut tasks = self.write();
        let entry = tasks.get_mut(&id).ok_or(WardenError::TaskNotFound(id))?;
        if entry.record.status != TaskStatus::Running {
            return Err(WardenError::Conflict {
                id,
                expected: TaskStatus::Running,
                actual: entry.record.status,
            });
        }
        let out = apply(&mut entry.record);
        entry.record.updated_at = Utc::now();
        Ok(out)
    }

    /// Raise the cancellation flag. Returns the status at the time of the
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::AlreadyTerminal`] for finished tasks.
    pub fn request_cancel(&self, id: TaskId) -> Result<TaskStatus, WardenError> {
        let mut tasks = self.write();
        let entry = tasks.get_mut(&id).ok_or(WardenError::TaskNotFound(id))?;
        let status = entry.record.status;
        if status.is_terminal() {
            return Err(WardenError::AlreadyTerminal { id, status });
        }
        entry.record.cancel_requested = true;
        entry.record.updated_at = Utc::now();
        Ok(status)
    }

    /// Whether cancellation was requested. Unknown ids count as cancelled.
    pub fn is_cancel_requested(&self, id: TaskId) -> bool {
        self.read()
            .get(&id)
            .map_or(true, |e| e.record.cancel_requested)
    }

    /// Resolve once `id` is terminal and return its final record.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::TaskNotFound`] if the task is unknown or is
    /// purged while waiting.
    pub async fn wait_for_terminal(&self, id: TaskId) -> Result<TaskRecord, WardenError> {
        let mut rx = {
            let tasks = self.read();
            let entry = tasks.get(&id).ok_or(WardenError::TaskNotFound(id))?;
            entry.status_tx.subscribe()
        };
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| WardenError::TaskNotFound(id))?;
        self.get(id)
    }

    /// Remove terminal tasks last written more than `ttl` ago. Returns how
    /// many were removed.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, e| !(e.record.is_terminal() && e.record.updated_at < cutoff));
        let purged = before - tasks.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = tasks.len(), "purged expired tasks");
        }
        purged
    }

    /// Tasks per status.
    pub fn counts(&self) -> StatusCounts {
        let tasks = self.read();
        let mut counts = StatusCounts::default();
        for entry in tasks.values() {
            match entry.record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Entry {
    fn new(record: TaskRecord) -> Self {
        let (status_tx, _) = watch::channel(record.status);
        Self { record, status_tx }
    }
}

fn invalid(from: TaskStatus, to: TaskStatus, reason: &str) -> WardenError {
    WardenError::InvalidTransition {
        from,
        to,
        reason: reason.to_string(),
    }
}

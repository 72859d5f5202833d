//! The task executor.
//!
//! Submissions go onto an unbounded FIFO channel shared by a fixed pool of
//! worker tasks. A worker claims a task with a `PENDING -> RUNNING` CAS,
//! fetches and prepares the diff, reviews the chunks through the connection
//! pool and the retry engine, then commits the terminal state and hands the
//! record to the notification dispatcher.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use warden_core::{
    Chunk, ChunkReview, DiffSource, EndpointClass, NotificationChannel, NotificationEvent,
    QueueConfig, ReviewConfig, ReviewParams, ReviewStats, Reviewer, RunPhase, TaskError,
    TaskErrorKind, TaskId, TaskOutput, TaskPayload, TaskRecord, TaskStatus, WardenError,
    WorkerId,
};
use warden_difflens::prepare_diff;

use crate::notify::NotificationDispatcher;
use crate::pool::ConnectionPool;
use crate::retry::{
    bounded_call, default_classifier, run_with_retry, Retried, RetryContext, RetryError,
    RetryPolicy,
};
use crate::store::{StatusCounts, TaskStore, TransitionFields};

type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskId>>>;

/// Configures and starts an [`Executor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    queue: QueueConfig,
    review: ReviewConfig,
    diff_source: Option<Arc<dyn DiffSource>>,
    reviewer: Option<Arc<dyn Reviewer>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    store: Option<Arc<TaskStore>>,
}

impl ExecutorBuilder {
    /// The `[queue]` table.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// The `[review]` table (noise filter and comment filtering).
    pub fn review_config(mut self, config: ReviewConfig) -> Self {
        self.review = config;
        self
    }

    /// Where diffs come from.
    pub fn diff_source(mut self, source: Arc<dyn DiffSource>) -> Self {
        self.diff_source = Some(source);
        self
    }

    /// Who reviews chunks.
    pub fn reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Add one notification channel.
    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Add several notification channels.
    pub fn channels(mut self, channels: impl IntoIterator<Item = Arc<dyn NotificationChannel>>) -> Self {
        self.channels.extend(channels);
        self
    }

    /// Share an existing store instead of creating one.
    pub fn store(mut self, store: Arc<TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and spawn the workers. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] for an invalid `[queue]` table or a
    /// missing diff source or reviewer.
    pub fn start(self) -> Result<Executor, WardenError> {
        self.queue.validate()?;
        let diff_source = self
            .diff_source
            .ok_or_else(|| WardenError::Config("executor needs a diff source".into()))?;
        let reviewer = self
            .reviewer
            .ok_or_else(|| WardenError::Config("executor needs a reviewer".into()))?;

        let pool = ConnectionPool::from_config(&self.queue);
        let dispatcher =
            NotificationDispatcher::new(self.channels, pool.clone(), self.queue.per_call_timeout());
        let shared = Arc::new(Shared {
            store: self.store.unwrap_or_default(),
            // leases are taken outside the timed section, see `fetch_diff`
            retry: RetryPolicy {
                call_timeout: None,
                ..RetryPolicy::from_config(&self.queue)
            },
            call_timeout: self.queue.per_call_timeout(),
            pool,
            dispatcher,
            diff_source,
            reviewer,
            queue: self.queue,
            review: self.review,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let rx: Queue = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..shared.queue.max_concurrent_tasks)
            .map(|n| tokio::spawn(worker_loop(WorkerId(n), Arc::clone(&shared), Arc::clone(&rx))))
            .collect();

        let janitor = CancellationToken::new();
        tokio::spawn(purge_loop(Arc::clone(&shared), janitor.clone()));

        tracing::info!(
            workers = shared.queue.max_concurrent_tasks,
            git_limit = shared.pool.limit(EndpointClass::Git),
            llm_limit = shared.pool.limit(EndpointClass::Llm),
            notify_limit = shared.pool.limit(EndpointClass::Notify),
            "executor started"
        );

        Ok(Executor {
            shared,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            janitor,
        })
    }
}

/// In-process review task executor.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use warden_core::{DiffSource, QueueConfig, Reviewer, TaskPayload};
/// use warden_queue::Executor;
///
/// # async fn run(source: Arc<dyn DiffSource>, reviewer: Arc<dyn Reviewer>) -> warden_core::Result<()> {
/// let executor = Executor::builder()
///     .queue_config(QueueConfig::default())
///     .diff_source(source)
///     .reviewer(reviewer)
///     .start()?;
///
/// let id = executor.submit(TaskPayload {
///     repo: "github:acme/api".parse().unwrap(),
///     range: "main..feature".parse().unwrap(),
///     params: Default::default(),
/// })?;
/// let record = executor.wait(id).await?;
/// println!("{} finished as {}", record.id, record.status);
/// executor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Executor {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<TaskId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    janitor: CancellationToken,
}

impl Executor {
    /// Start configuring an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Queue a review under a fresh id. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, payload: TaskPayload) -> Result<TaskId, WardenError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = sender.as_ref().ok_or(WardenError::ShutDown)?;
        let id = self.shared.store.create(payload);
        self.enqueue(tx, id)?;
        Ok(id)
    }

    /// Queue a review under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::DuplicateTask`] if `id` exists and
    /// [`WardenError::ShutDown`] after shutdown.
    pub fn submit_with_id(&self, id: TaskId, payload: TaskPayload) -> Result<(), WardenError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = sender.as_ref().ok_or(WardenError::ShutDown)?;
        self.shared.store.create_with_id(id, payload)?;
        self.enqueue(tx, id)
    }

    fn enqueue(&self, tx: &mpsc::UnboundedSender<TaskId>, id: TaskId) -> Result<(), WardenError> {
        tx.send(id).map_err(|_| WardenError::ShutDown)?;
        tracing::debug!(task_id = %id, "task queued");
        Ok(())
    }

    /// Latest record of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::TaskNotFound`] for unknown or purged ids.
    pub fn status(&self, id: TaskId) -> Result<TaskRecord, WardenError> {
        self.shared.store.get(id)
    }

    /// Request cancellation.
    ///
    /// A pending task fails immediately with a cancellation error. A running
    /// task stops at its next checkpoint; reviewer calls already in flight
    /// are allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::AlreadyTerminal`] for finished tasks and
    /// [`WardenError::TaskNotFound`] for unknown ids.
    pub fn cancel(&self, id: TaskId) -> Result<(), WardenError> {
        let store = &self.shared.store;
        let status = store.request_cancel(id)?;
        if status != TaskStatus::Pending {
            tracing::info!(task_id = %id, %status, "cancellation requested");
            return Ok(());
        }

        let error = TaskError::new(TaskErrorKind::Cancelled, "cancelled before start");
        match store.transition(
            id,
            TaskStatus::Pending,
            TaskStatus::Failed,
            TransitionFields::failed(error),
        ) {
            Ok(record) => {
                tracing::info!(task_id = %id, "pending task cancelled");
                self.shared.dispatcher.on_terminal(&record);
                Ok(())
            }
            // a worker claimed it meanwhile; the flag stops it
            Err(WardenError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolve once `id` is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::TaskNotFound`] for unknown or purged ids.
    pub async fn wait(&self, id: TaskId) -> Result<TaskRecord, WardenError> {
        self.shared.store.wait_for_terminal(id).await
    }

    /// Receive every terminal event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.shared.dispatcher.subscribe()
    }

    /// The store backing this executor.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.shared.store
    }

    /// The connection pool shared by all workers.
    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// Tasks per status.
    pub fn counts(&self) -> StatusCounts {
        self.shared.store.counts()
    }

    /// Drop terminal tasks older than the configured result TTL.
    pub fn purge_expired(&self) -> usize {
        self.shared.store.purge_expired(self.shared.queue.result_ttl())
    }

    /// Stop accepting submissions, let the workers drain the queue, then
    /// wait for outstanding notification sends.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker terminated abnormally");
            }
        }
        self.janitor.cancel();
        self.shared.dispatcher.drain().await;
        tracing::info!("executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.janitor.cancel();
    }
}

struct Shared {
    store: Arc<TaskStore>,
    pool: ConnectionPool,
    retry: RetryPolicy,
    call_timeout: Duration,
    dispatcher: NotificationDispatcher,
    diff_source: Arc<dyn DiffSource>,
    reviewer: Arc<dyn Reviewer>,
    queue: QueueConfig,
    review: ReviewConfig,
}

async fn worker_loop(worker: WorkerId, shared: Arc<Shared>, queue: Queue) {
    tracing::debug!(%worker, "worker started");
    loop {
        let next = queue.lock().await.recv().await;
        let Some(id) = next else { break };
        shared.run_task(worker, id).await;
    }
    tracing::debug!(%worker, "worker stopped");
}

async fn purge_loop(shared: Arc<Shared>, token: CancellationToken) {
    let period = shared.queue.result_ttl().clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                shared.store.purge_expired(shared.queue.result_ttl());
            }
        }
    }
}

impl Shared {
    async fn run_task(self: &Arc<Self>, worker: WorkerId, id: TaskId) {
        let record = match self.store.transition(
            id,
            TaskStatus::Pending,
            TaskStatus::Running,
            TransitionFields::running(worker),
        ) {
            Ok(record) => record,
            Err(WardenError::Conflict { actual, .. }) => {
                tracing::debug!(task_id = %id, %worker, status = %actual, "task no longer pending, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %id, %worker, error = %e, "failed to claim task");
                return;
            }
        };
        tracing::info!(
            task_id = %id,
            %worker,
            repo = %record.payload.repo,
            range = %record.payload.range,
            "task started"
        );

        let shared = Arc::clone(self);
        let payload = record.payload;
        let handle = tokio::spawn(async move { shared.process(id, &payload).await });
        let abort = handle.abort_handle();

        let budget = self.queue.per_task_timeout();
        let outcome = match tokio::time::timeout(budget, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                tracing::error!(task_id = %id, %worker, panic = %message, "task panicked");
                Err(TaskError::new(
                    TaskErrorKind::InternalScheduling,
                    format!("task panicked: {message}"),
                ))
            }
            Ok(Err(join_error)) => {
                tracing::error!(task_id = %id, %worker, error = %join_error, "task aborted");
                Err(TaskError::new(
                    TaskErrorKind::InternalScheduling,
                    format!("task aborted: {join_error}"),
                ))
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(task_id = %id, %worker, budget_ms = budget.as_millis() as u64, "task exceeded its time budget");
                Err(TaskError::new(
                    TaskErrorKind::Timeout,
                    format!("task exceeded {} ms", budget.as_millis()),
                ))
            }
        };

        self.finish(id, worker, outcome);
    }

    fn finish(&self, id: TaskId, worker: WorkerId, outcome: Result<TaskOutput, TaskError>) {
        let (to, fields) = match outcome {
            Ok(output) => (TaskStatus::Succeeded, TransitionFields::succeeded(output)),
            Err(error) => (TaskStatus::Failed, TransitionFields::failed(error)),
        };

        let committed = self
            .store
            .transition(id, TaskStatus::Running, to, fields)
            .or_else(|e| {
                tracing::error!(task_id = %id, %worker, error = %e, "failed to commit terminal state");
                let error = TaskError::new(TaskErrorKind::InternalScheduling, e.to_string());
                self.store.transition(
                    id,
                    TaskStatus::Running,
                    TaskStatus::Failed,
                    TransitionFields::failed(error),
                )
            });

        match committed {
            Ok(record) => {
                match &record.error {
                    None => tracing::info!(task_id = %id, %worker, retries = record.retry_count, "task succeeded"),
                    Some(error) => tracing::warn!(
                        task_id = %id,
                        %worker,
                        kind = %error.kind,
                        chunk = ?error.chunk_index,
                        error = %error.message,
                        "task failed"
                    ),
                }
                self.dispatcher.on_terminal(&record);
            }
            Err(e) => {
                tracing::error!(task_id = %id, %worker, error = %e, "task left without a terminal state");
            }
        }
    }

    async fn process(self: &Arc<Self>, id: TaskId, payload: &TaskPayload) -> Result<TaskOutput, TaskError> {
        self.checkpoint(id)?;
        self.set_phase(id, RunPhase::FetchingDiff);
        let raw = self.fetch_diff(id, payload).await?;

        let prepared = prepare_diff(&raw, &self.review, self.queue.chunk_size_limit)
            .map_err(|e| TaskError::new(TaskErrorKind::UpstreamFetch, e.to_string()))?;
        let total = prepared.chunks.len();
        tracing::debug!(task_id = %id, chunks = total, files = prepared.files_reviewed, "diff prepared");

        self.set_phase(id, RunPhase::Reviewing { completed: 0, total });
        let reviews = self.review_chunks(id, &payload.params, prepared.chunks).await?;
        self.checkpoint(id)?;

        let mut stats = ReviewStats {
            files_reviewed: prepared.files_reviewed,
            files_skipped: prepared.skipped,
            chunks: total,
            hunks: prepared.hunks,
            model_used: self.reviewer.model().to_string(),
            ..ReviewStats::default()
        };
        for review in &reviews {
            stats.absorb(review);
        }
        Ok(TaskOutput {
            chunks: reviews,
            stats,
        })
    }

    async fn fetch_diff(&self, id: TaskId, payload: &TaskPayload) -> Result<String, TaskError> {
        let pool = &self.pool;
        let source = &self.diff_source;
        let limit = self.call_timeout;
        let result = run_with_retry(
            "fetch_diff",
            &self.retry,
            default_classifier,
            |ctx| self.note_retry(id, ctx),
            move || async move {
                let lease = pool.acquire(EndpointClass::Git).await?;
                let diff =
                    bounded_call("fetch_diff", limit, source.fetch_diff(&payload.repo, &payload.range))
                        .await;
                lease.ensure_held()?;
                diff
            },
        )
        .await;

        result
            .map(|retried| retried.value)
            .map_err(|e| task_error(TaskErrorKind::UpstreamFetch, e))
    }

    async fn review_chunks(
        self: &Arc<Self>,
        id: TaskId,
        params: &ReviewParams,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<ChunkReview>, TaskError> {
        let total = chunks.len();
        let limit = self.queue.chunk_parallelism.max(1);
        let mut pending = chunks.into_iter();
        let mut in_flight: JoinSet<Result<Retried<ChunkReview>, RetryError>> = JoinSet::new();
        let mut indices: HashMap<task::Id, usize> = HashMap::new();
        let mut slots: Vec<Option<ChunkReview>> = (0..total).map(|_| None).collect();
        let mut failure: Option<TaskError> = None;
        let mut cancelled = false;
        let mut completed = 0;

        loop {
            while failure.is_none() && !cancelled && in_flight.len() < limit {
                let Some(chunk) = pending.next() else { break };
                if self.store.is_cancel_requested(id) {
                    cancelled = true;
                    break;
                }
                let shared = Arc::clone(self);
                let params = params.clone();
                let index = chunk.index;
                let handle =
                    in_flight.spawn(async move { shared.review_chunk(id, &chunk, &params).await });
                indices.insert(handle.id(), index);
            }

            let Some(joined) = in_flight.join_next_with_id().await else { break };
            match joined {
                Ok((task_id, Ok(retried))) => {
                    let index = indices.remove(&task_id).unwrap_or(usize::MAX);
                    let Some(slot) = slots.get_mut(index) else {
                        let error = TaskError::new(
                            TaskErrorKind::InternalScheduling,
                            format!("chunk index {index} out of range"),
                        );
                        keep_lowest(&mut failure, error, None);
                        continue;
                    };
                    *slot = Some(retried.value);
                    completed += 1;
                    tracing::debug!(task_id = %id, chunk = index, attempts = retried.attempts, completed, total, "chunk reviewed");
                    self.set_phase(id, RunPhase::Reviewing { completed, total });
                }
                Ok((task_id, Err(err))) => {
                    let index = indices.remove(&task_id);
                    tracing::warn!(task_id = %id, chunk = ?index, attempts = err.attempts, error = %err.source, "chunk failed");
                    let error = task_error(TaskErrorKind::UpstreamReview, err);
                    keep_lowest(&mut failure, error, index);
                }
                Err(join_error) => {
                    let index = indices.remove(&join_error.id());
                    let message = if join_error.is_panic() {
                        format!("chunk review panicked: {}", panic_message(join_error.into_panic()))
                    } else {
                        format!("chunk review aborted: {join_error}")
                    };
                    tracing::error!(task_id = %id, chunk = ?index, error = %message, "chunk task failed");
                    let error = TaskError::new(TaskErrorKind::InternalScheduling, message);
                    keep_lowest(&mut failure, error, index);
                }
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }
        if cancelled {
            return Err(cancelled_error());
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TaskError::new(TaskErrorKind::InternalScheduling, "missing chunk result"))
    }

    async fn review_chunk(
        &self,
        id: TaskId,
        chunk: &Chunk,
        params: &ReviewParams,
    ) -> Result<Retried<ChunkReview>, RetryError> {
        let pool = &self.pool;
        let reviewer = &self.reviewer;
        let operation = format!("review_chunk[{}]", chunk.index);
        let name = operation.as_str();
        let limit = self.call_timeout;
        run_with_retry(
            name,
            &self.retry,
            default_classifier,
            |ctx| self.note_retry(id, ctx),
            move || async move {
                let lease = pool.acquire(EndpointClass::Llm).await?;
                let review = bounded_call(name, limit, reviewer.review(chunk, params)).await;
                lease.ensure_held()?;
                review
            },
        )
        .await
    }

    fn checkpoint(&self, id: TaskId) -> Result<(), TaskError> {
        if self.store.is_cancel_requested(id) {
            return Err(cancelled_error());
        }
        Ok(())
    }

    fn set_phase(&self, id: TaskId, phase: RunPhase) {
        if let Err(e) = self.store.set_phase(id, phase) {
            tracing::debug!(task_id = %id, error = %e, "could not update run phase");
        }
    }

    fn note_retry(&self, id: TaskId, ctx: &RetryContext<'_>) {
        let phase = RunPhase::Retrying {
            operation: ctx.operation.to_string(),
            attempt: ctx.attempt + 1,
        };
        if let Err(e) = self.store.record_retry(id, phase) {
            tracing::debug!(task_id = %id, error = %e, "could not record retry");
        }
    }
}

/// Record the failure of chunk `index` unless a lower chunk already failed.
/// Failures without an index rank after every chunk.
fn keep_lowest(failure: &mut Option<TaskError>, error: TaskError, index: Option<usize>) {
    let error = match index {
        Some(index) => error.with_chunk(index),
        None => error,
    };
    let rank = |e: &TaskError| e.chunk_index.unwrap_or(usize::MAX);
    if failure.as_ref().map_or(true, |held| rank(&error) < rank(held)) {
        *failure = Some(error);
    }
}

fn task_error(kind: TaskErrorKind, err: RetryError) -> TaskError {
    let kind = match err.source {
        WardenError::Timeout(_) => TaskErrorKind::Timeout,
        WardenError::LeaseLeaked(_) => TaskErrorKind::InternalScheduling,
        _ => kind,
    };
    TaskError::new(kind, err.source.to_string()).with_attempts(err.attempts)
}

fn cancelled_error() -> TaskError {
    TaskError::new(TaskErrorKind::Cancelled, "cancelled by request")
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

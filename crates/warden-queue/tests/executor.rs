use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use warden_core::{
    Chunk, ChunkReview, CommitRange, DiffSource, EndpointClass, NotificationChannel,
    NotificationEvent, QueueConfig, RepoRef, ReviewParams, Reviewer, TaskErrorKind, TaskId,
    TaskPayload, TaskStatus, WardenError,
};
use warden_queue::{Executor, TaskStore};

fn diff_with_files(n: usize) -> String {
    (0..n)
        .map(|i| {
            format!(
                "diff --git a/src/f{i}.rs b/src/f{i}.rs\n\
                 --- a/src/f{i}.rs\n\
                 +++ b/src/f{i}.rs\n\
                 @@ -1,1 +1,2 @@\n \
                 fn f{i}() {{}}\n\
                 +fn g{i}() {{}}\n"
            )
        })
        .collect()
}

fn payload() -> TaskPayload {
    TaskPayload {
        repo: "github:acme/api".parse().unwrap(),
        range: "main..feature".parse().unwrap(),
        params: ReviewParams::default(),
    }
}

/// One chunk per file, fast backoff.
fn config() -> QueueConfig {
    QueueConfig {
        max_concurrent_tasks: 2,
        max_retry_attempts: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        per_call_timeout_ms: 5_000,
        per_task_timeout_ms: 10_000,
        chunk_size_limit: 1,
        chunk_parallelism: 4,
        ..QueueConfig::default()
    }
}

struct FlakyDiff {
    diff: String,
    failures: AtomicU32,
    terminal: bool,
    calls: AtomicU32,
}

impl FlakyDiff {
    fn new(files: usize) -> Self {
        Self::failing(files, 0)
    }

    fn failing(files: usize, failures: u32) -> Self {
        Self {
            diff: diff_with_files(files),
            failures: AtomicU32::new(failures),
            terminal: false,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DiffSource for FlakyDiff {
    async fn fetch_diff(&self, _repo: &RepoRef, _range: &CommitRange) -> Result<String, WardenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.terminal {
            return Err(WardenError::Upstream {
                status: 404,
                message: "no such commit".into(),
            });
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(WardenError::Network("connection reset".into()));
        }
        Ok(self.diff.clone())
    }
}

#[derive(Default)]
struct ScriptedReviewer {
    delays: HashMap<usize, Duration>,
    always_fail: HashSet<usize>,
    panic_once: AtomicBool,
    panic_on: Option<usize>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedReviewer {
    fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, index: usize) -> usize {
        self.calls().iter().filter(|i| **i == index).count()
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn review(&self, chunk: &Chunk, _params: &ReviewParams) -> Result<ChunkReview, WardenError> {
        self.calls.lock().unwrap().push(chunk.index);
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("reviewer exploded");
        }
        if let Some((started, release)) = &self.gate {
            if chunk.index == 0 {
                started.notify_one();
                release.notified().await;
            }
        }
        if let Some(delay) = self.delays.get(&chunk.index) {
            tokio::time::sleep(*delay).await;
        }
        if self.panic_on == Some(chunk.index) {
            panic!("reviewer exploded on chunk {}", chunk.index);
        }
        if self.always_fail.contains(&chunk.index) {
            return Err(WardenError::Upstream {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        Ok(ChunkReview {
            index: chunk.index,
            files: chunk.files.clone(),
            fingerprint: chunk.fingerprint.clone(),
            summary: Some(format!("chunk {}", chunk.index)),
            ..ChunkReview::default()
        })
    }
}

#[derive(Default)]
struct RecordingChannel {
    events: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn start(
    config: QueueConfig,
    source: Arc<FlakyDiff>,
    reviewer: Arc<ScriptedReviewer>,
    channel: Arc<RecordingChannel>,
) -> Executor {
    Executor::builder()
        .queue_config(config)
        .diff_source(source)
        .reviewer(reviewer)
        .channel(channel)
        .start()
        .unwrap()
}

#[tokio::test]
async fn chunks_merge_in_order_regardless_of_completion() {
    let reviewer = Arc::new(ScriptedReviewer {
        delays: HashMap::from([
            (0, Duration::from_millis(60)),
            (1, Duration::from_millis(40)),
            (2, Duration::from_millis(20)),
        ]),
        ..Default::default()
    });
    let executor = start(
        config(),
        Arc::new(FlakyDiff::new(4)),
        reviewer,
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Succeeded);
    assert!(record.error.is_none());
    let output = record.result.unwrap();
    let order: Vec<usize> = output.chunks.iter().map(|c| c.index).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert_eq!(output.stats.chunks, 4);
    assert_eq!(output.stats.llm_calls, 4);
    assert_eq!(output.stats.files_reviewed, 4);
    assert_eq!(output.stats.model_used, "fake-model");
    executor.shutdown().await;
}

#[tokio::test]
async fn fetch_retried_until_success() {
    let source = Arc::new(FlakyDiff::failing(2, 2));
    let executor = start(
        config(),
        Arc::clone(&source),
        Arc::default(),
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Succeeded);
    assert_eq!(record.retry_count, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    executor.shutdown().await;
}

#[tokio::test]
async fn terminal_fetch_error_is_not_retried() {
    let source = Arc::new(FlakyDiff {
        terminal: true,
        ..FlakyDiff::new(1)
    });
    let executor = start(
        config(),
        Arc::clone(&source),
        Arc::default(),
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();

    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::UpstreamFetch);
    assert_eq!(error.attempts, Some(1));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(record.result.is_none());
    executor.shutdown().await;
}

#[tokio::test]
async fn exhausted_chunk_fails_whole_task() {
    let reviewer = Arc::new(ScriptedReviewer {
        always_fail: HashSet::from([2]),
        ..Default::default()
    });
    let executor = start(
        config(),
        Arc::new(FlakyDiff::new(3)),
        Arc::clone(&reviewer),
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.result.is_none());
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::UpstreamReview);
    assert_eq!(error.chunk_index, Some(2));
    assert_eq!(error.attempts, Some(3));
    assert_eq!(reviewer.calls_for(2), 3);
    assert_eq!(record.retry_count, 2);
    executor.shutdown().await;
}

#[tokio::test]
async fn cancel_between_chunks_stops_dispatch() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let reviewer = Arc::new(ScriptedReviewer {
        gate: Some((Arc::clone(&started), Arc::clone(&release))),
        ..Default::default()
    });
    let channel = Arc::new(RecordingChannel::default());
    let executor = start(
        QueueConfig {
            chunk_parallelism: 1,
            ..config()
        },
        Arc::new(FlakyDiff::new(3)),
        Arc::clone(&reviewer),
        Arc::clone(&channel),
    );
    let mut events = executor.subscribe();

    let id = executor.submit(payload()).unwrap();
    started.notified().await;
    executor.cancel(id).unwrap();
    release.notify_one();

    let record = executor.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.unwrap().kind, TaskErrorKind::Cancelled);
    assert!(record.cancel_requested);
    assert_eq!(reviewer.calls(), vec![0]);

    executor.shutdown().await;
    let event = events.recv().await.unwrap();
    assert_eq!(event.task_id, id);
    assert!(events.try_recv().is_err());
    assert_eq!(channel.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_pending_task_fails_it_immediately() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let reviewer = Arc::new(ScriptedReviewer {
        gate: Some((Arc::clone(&started), Arc::clone(&release))),
        ..Default::default()
    });
    let channel = Arc::new(RecordingChannel::default());
    let executor = start(
        QueueConfig {
            max_concurrent_tasks: 1,
            ..config()
        },
        Arc::new(FlakyDiff::new(1)),
        Arc::clone(&reviewer),
        Arc::clone(&channel),
    );

    let first = executor.submit(payload()).unwrap();
    started.notified().await;
    let second = executor.submit(payload()).unwrap();
    assert_eq!(executor.status(second).unwrap().status, TaskStatus::Pending);

    executor.cancel(second).unwrap();
    let cancelled = executor.status(second).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.error.unwrap().kind, TaskErrorKind::Cancelled);
    assert!(matches!(
        executor.cancel(second),
        Err(WardenError::AlreadyTerminal { .. })
    ));

    release.notify_one();
    let done = executor.wait(first).await.unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    executor.shutdown().await;

    // the cancelled task was never picked up
    assert_eq!(reviewer.calls(), vec![0]);
    let notified: Vec<TaskId> = channel.events.lock().unwrap().iter().map(|e| e.task_id).collect();
    assert_eq!(notified.len(), 2);
    assert!(notified.contains(&first) && notified.contains(&second));
}

#[tokio::test]
async fn task_budget_aborts_and_releases_leases() {
    let reviewer = Arc::new(ScriptedReviewer {
        delays: HashMap::from([(0, Duration::from_secs(30))]),
        ..Default::default()
    });
    let executor = start(
        QueueConfig {
            per_task_timeout_ms: 100,
            ..config()
        },
        Arc::new(FlakyDiff::new(1)),
        reviewer,
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.unwrap().kind, TaskErrorKind::Timeout);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.pool().in_flight(EndpointClass::Llm), 0);
    executor.shutdown().await;
}

#[tokio::test]
async fn call_timeout_exhaustion_is_timeout_error() {
    let reviewer = Arc::new(ScriptedReviewer {
        delays: HashMap::from([(0, Duration::from_millis(500))]),
        ..Default::default()
    });
    let executor = start(
        QueueConfig {
            per_call_timeout_ms: 20,
            max_retry_attempts: 2,
            ..config()
        },
        Arc::new(FlakyDiff::new(1)),
        Arc::clone(&reviewer),
        Arc::default(),
    );

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::Timeout);
    assert_eq!(error.chunk_index, Some(0));
    assert_eq!(error.attempts, Some(2));
    assert_eq!(reviewer.calls_for(0), 2);
    executor.shutdown().await;
}

#[tokio::test]
async fn waiting_for_a_slot_does_not_count_against_call_timeout() {
    let reviewer = Arc::new(ScriptedReviewer {
        delays: (0..4).map(|i| (i, Duration::from_millis(30))).collect(),
        ..Default::default()
    });
    let mut config = QueueConfig {
        per_call_timeout_ms: 80,
        max_retry_attempts: 1,
        chunk_parallelism: 4,
        ..config()
    };
    config.endpoint_limits.insert("llm".into(), 1);
    let executor = start(config, Arc::new(FlakyDiff::new(4)), Arc::clone(&reviewer), Arc::default());

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Succeeded, "error: {:?}", record.error);
    assert_eq!(record.result.unwrap().chunks.len(), 4);
    assert_eq!(reviewer.calls().len(), 4);
    assert_eq!(executor.pool().peak(EndpointClass::Llm), 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn chunk_panic_keeps_lowest_failing_index() {
    let reviewer = Arc::new(ScriptedReviewer {
        always_fail: HashSet::from([0]),
        delays: HashMap::from([(1, Duration::from_millis(100))]),
        panic_on: Some(1),
        ..Default::default()
    });
    let executor = start(config(), Arc::new(FlakyDiff::new(2)), Arc::clone(&reviewer), Arc::default());

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::UpstreamReview);
    assert_eq!(error.chunk_index, Some(0));
    assert_eq!(reviewer.calls_for(1), 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn earlier_panic_yields_to_lower_chunk_failure() {
    let reviewer = Arc::new(ScriptedReviewer {
        always_fail: HashSet::from([0]),
        delays: HashMap::from([(0, Duration::from_millis(40))]),
        panic_on: Some(1),
        ..Default::default()
    });
    let executor = start(config(), Arc::new(FlakyDiff::new(2)), Arc::clone(&reviewer), Arc::default());

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::UpstreamReview);
    assert_eq!(error.chunk_index, Some(0));
    executor.shutdown().await;
}

#[tokio::test]
async fn lone_chunk_panic_names_its_index() {
    let reviewer = Arc::new(ScriptedReviewer {
        panic_on: Some(1),
        ..Default::default()
    });
    let executor = start(config(), Arc::new(FlakyDiff::new(3)), Arc::clone(&reviewer), Arc::default());

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::InternalScheduling);
    assert_eq!(error.chunk_index, Some(1));
    assert!(error.message.contains("panicked"), "{}", error.message);
    executor.shutdown().await;
}

#[tokio::test]
async fn dropping_without_shutdown_releases_background_tasks() {
    let store = Arc::new(TaskStore::new());
    let executor = Executor::builder()
        .queue_config(config())
        .diff_source(Arc::new(FlakyDiff::new(1)))
        .reviewer(Arc::new(ScriptedReviewer::default()))
        .store(Arc::clone(&store))
        .start()
        .unwrap();
    let id = executor.submit(payload()).unwrap();
    executor.wait(id).await.unwrap();
    drop(executor);

    let released = tokio::time::timeout(Duration::from_secs(2), async {
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "background tasks still hold the store");
    assert_eq!(store.get(id).unwrap().status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn panic_fails_task_but_not_worker() {
    let reviewer = Arc::new(ScriptedReviewer {
        panic_once: AtomicBool::new(true),
        ..Default::default()
    });
    let executor = start(
        QueueConfig {
            max_concurrent_tasks: 1,
            ..config()
        },
        Arc::new(FlakyDiff::new(1)),
        reviewer,
        Arc::default(),
    );

    let first = executor.submit(payload()).unwrap();
    let record = executor.wait(first).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::InternalScheduling);
    assert!(error.message.contains("reviewer exploded"));

    let second = executor.submit(payload()).unwrap();
    let record = executor.wait(second).await.unwrap();
    assert_eq!(record.status, TaskStatus::Succeeded);
    executor.shutdown().await;
}

#[tokio::test]
async fn llm_calls_respect_class_limit() {
    let reviewer = Arc::new(ScriptedReviewer {
        delays: (0..4).map(|i| (i, Duration::from_millis(15))).collect(),
        ..Default::default()
    });
    let mut config = QueueConfig {
        max_concurrent_tasks: 3,
        ..config()
    };
    config.endpoint_limits.insert("llm".into(), 2);
    let executor = start(config, Arc::new(FlakyDiff::new(4)), reviewer, Arc::default());

    let ids: Vec<TaskId> = (0..3).map(|_| executor.submit(payload()).unwrap()).collect();
    for id in ids {
        assert_eq!(executor.wait(id).await.unwrap().status, TaskStatus::Succeeded);
    }
    assert!(executor.pool().peak(EndpointClass::Llm) <= 2);
    assert_eq!(executor.pool().in_flight(EndpointClass::Llm), 0);
    assert_eq!(executor.pool().leaks(), 0);
    executor.shutdown().await;
}

#[tokio::test]
async fn every_task_notified_exactly_once() {
    let channel = Arc::new(RecordingChannel::default());
    let reviewer = Arc::new(ScriptedReviewer {
        always_fail: HashSet::from([1]),
        ..Default::default()
    });
    let executor = start(
        config(),
        Arc::new(FlakyDiff::new(2)),
        reviewer,
        Arc::clone(&channel),
    );
    let mut events = executor.subscribe();

    let ids: Vec<TaskId> = (0..5).map(|_| executor.submit(payload()).unwrap()).collect();
    executor.shutdown().await;

    let sent = channel.events.lock().unwrap().clone();
    assert_eq!(sent.len(), ids.len());
    let unique: HashSet<TaskId> = sent.iter().map(|e| e.task_id).collect();
    assert_eq!(unique, ids.iter().copied().collect());
    assert!(sent.iter().all(|e| e.outcome == TaskStatus::Failed));
    assert!(sent.iter().all(|e| e.channels == vec!["recording".to_string()]));

    for _ in 0..ids.len() {
        events.recv().await.unwrap();
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn submissions_after_shutdown_are_rejected() {
    let executor = start(
        config(),
        Arc::new(FlakyDiff::new(1)),
        Arc::default(),
        Arc::default(),
    );
    let id = TaskId::new();
    executor.submit_with_id(id, payload()).unwrap();
    assert!(matches!(
        executor.submit_with_id(id, payload()),
        Err(WardenError::DuplicateTask(_))
    ));

    executor.shutdown().await;
    assert_eq!(executor.status(id).unwrap().status, TaskStatus::Succeeded);
    assert!(matches!(
        executor.submit(payload()),
        Err(WardenError::ShutDown)
    ));
}

#[tokio::test]
async fn empty_diff_succeeds_without_review_calls() {
    let source = Arc::new(FlakyDiff::new(0));
    let reviewer = Arc::new(ScriptedReviewer::default());
    let executor = start(config(), source, Arc::clone(&reviewer), Arc::default());

    let id = executor.submit(payload()).unwrap();
    let record = executor.wait(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Succeeded);
    assert!(record.result.unwrap().chunks.is_empty());
    assert!(reviewer.calls().is_empty());
    executor.shutdown().await;
}

#[tokio::test]
async fn executors_are_independent() {
    let a = start(config(), Arc::new(FlakyDiff::new(1)), Arc::default(), Arc::default());
    let b = start(config(), Arc::new(FlakyDiff::new(1)), Arc::default(), Arc::default());

    let id = a.submit(payload()).unwrap();
    a.wait(id).await.unwrap();
    assert!(matches!(b.status(id), Err(WardenError::TaskNotFound(_))));
    assert_eq!(a.counts().succeeded, 1);
    assert_eq!(b.counts().total(), 0);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let err = Executor::builder()
        .queue_config(QueueConfig {
            max_concurrent_tasks: 0,
            ..QueueConfig::default()
        })
        .diff_source(Arc::new(FlakyDiff::new(1)))
        .reviewer(Arc::new(ScriptedReviewer::default()))
        .start()
        .err()
        .unwrap();
    assert!(matches!(err, WardenError::Config(_)));

    let err = Executor::builder().start().err().unwrap();
    assert!(matches!(err, WardenError::Config(_)));
}

//! Terminal-task fan-out.
//!
//! The dispatcher turns a finished [`TaskRecord`] into one
//! [`NotificationEvent`], broadcasts it to in-process subscribers and hands
//! it to every configured channel concurrently. Channel failures are logged
//! and dropped; they never touch task state.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use warden_core::{
    EndpointClass, NotificationChannel, NotificationEvent, NotificationSummary, ReviewStats,
    TaskRecord, TaskStatus,
};

use crate::pool::ConnectionPool;

const EVENT_CAPACITY: usize = 256;

/// Fans terminal events out to subscribers and channels.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    pool: ConnectionPool,
    send_timeout: Duration,
    events: broadcast::Sender<NotificationEvent>,
    sends: TaskTracker,
}

impl NotificationDispatcher {
    /// Dispatcher over `channels`. Sends share the notify class of `pool`
    /// and are each bounded by `send_timeout`.
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        pool: ConnectionPool,
        send_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channels,
            pool,
            send_timeout,
            events,
            sends: TaskTracker::new(),
        }
    }

    /// Receive every terminal event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    /// Names of the configured channels, in order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Build the event for a terminal `record`.
    pub fn build_event(&self, record: &TaskRecord) -> NotificationEvent {
        NotificationEvent {
            task_id: record.id,
            outcome: record.status,
            summary: summarize(record),
            channels: self.channel_names(),
        }
    }

    /// Emit the completion of `record`. Called once per task, by whoever
    /// committed its terminal transition. Returns the emitted event, or
    /// `None` if `record` is not terminal.
    pub fn on_terminal(&self, record: &TaskRecord) -> Option<NotificationEvent> {
        if !record.is_terminal() {
            tracing::error!(
                task_id = %record.id,
                status = %record.status,
                "refusing to notify for a non-terminal task"
            );
            return None;
        }

        let event = self.build_event(record);
        // no subscribers is fine
        let _ = self.events.send(event.clone());

        let shared = Arc::new(event.clone());
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&shared);
            let pool = self.pool.clone();
            let send_timeout = self.send_timeout;
            self.sends.spawn(async move {
                deliver(channel, &event, &pool, send_timeout).await;
            });
        }
        Some(event)
    }

    /// Wait for in-flight channel sends. New sends are still accepted.
    pub async fn drain(&self) {
        self.sends.close();
        self.sends.wait().await;
        self.sends.reopen();
    }
}

async fn deliver(
    channel: Arc<dyn NotificationChannel>,
    event: &NotificationEvent,
    pool: &ConnectionPool,
    send_timeout: Duration,
) {
    let name = channel.name().to_string();
    let _lease = match pool.acquire(EndpointClass::Notify).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(task_id = %event.task_id, channel = %name, error = %e, "no notification slot");
            return;
        }
    };
    match tokio::time::timeout(send_timeout, channel.send(event)).await {
        Ok(Ok(())) => {
            tracing::debug!(task_id = %event.task_id, channel = %name, "notification sent");
        }
        Ok(Err(e)) => {
            tracing::warn!(task_id = %event.task_id, channel = %name, error = %e, "notification failed");
        }
        Err(_) => {
            tracing::warn!(
                task_id = %event.task_id,
                channel = %name,
                timeout_ms = send_timeout.as_millis() as u64,
                "notification timed out"
            );
        }
    }
}

/// Human-readable title and markdown body for a terminal record.
pub fn summarize(record: &TaskRecord) -> NotificationSummary {
    let repo = &record.payload.repo;
    let range = &record.payload.range;
    let (title, body) = match (&record.status, &record.result, &record.error) {
        (TaskStatus::Succeeded, Some(output), _) => (
            format!("Review of {repo} {range} succeeded"),
            render_stats(&output.stats),
        ),
        (_, _, Some(error)) => {
            let mut body = format!("**{}**: {}", error.kind, error.message);
            if let Some(index) = error.chunk_index {
                let _ = write!(body, "\n- Chunk: {index}");
            }
            if let Some(attempts) = error.attempts {
                let _ = write!(body, "\n- Attempts: {attempts}");
            }
            if record.retry_count > 0 {
                let _ = write!(body, "\n- Retries: {}", record.retry_count);
            }
            (format!("Review of {repo} {range} failed"), body)
        }
        _ => (
            format!("Review of {repo} {range} is {}", record.status),
            String::new(),
        ),
    };

    NotificationSummary {
        title,
        body,
        repo: repo.clone(),
        range: range.clone(),
        error: record.error.clone(),
        stats: record.result.as_ref().map(|o| o.stats.clone()),
    }
}

fn render_stats(stats: &ReviewStats) -> String {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "- Files reviewed: {} ({} skipped)",
        stats.files_reviewed,
        stats.files_skipped.len()
    );
    let _ = writeln!(body, "- Chunks: {}, hunks: {}", stats.chunks, stats.hunks);
    let _ = writeln!(
        body,
        "- Comments: {} ({} bugs, {} warnings, {} suggestions, {} info)",
        stats.comments_total(),
        stats.bugs,
        stats.warnings,
        stats.suggestions,
        stats.infos
    );
    if stats.unit_tests > 0 || stats.scenarios > 0 {
        let _ = writeln!(
            body,
            "- Generated: {} unit tests, {} scenarios",
            stats.unit_tests, stats.scenarios
        );
    }
    if !stats.model_used.is_empty() {
        let _ = writeln!(body, "- Model: {}", stats.model_used);
    }
    body.trim_end().to_string()
}

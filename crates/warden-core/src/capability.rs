//! Seams between the executor and the outside world.
//!
//! The executor only ever talks to Git providers, LLM backends and
//! notification transports through these traits, so tests can swap in fakes
//! and many executors can coexist with different backends.

use async_trait::async_trait;

use crate::error::WardenError;
use crate::task::{CommitRange, RepoRef, ReviewParams};
use crate::types::{Chunk, ChunkReview, NotificationEvent};

/// Fetches the unified diff of a commit range.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Return the unified diff between `range.base` and `range.head`.
    ///
    /// # Errors
    ///
    /// Transient failures should map to variants for which
    /// [`WardenError::is_transient`] is `true` so the caller retries them.
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError>;
}

/// Reviews one diff chunk.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Model identifier reported in review statistics.
    fn model(&self) -> &str;

    /// Review `chunk` and return comments plus any requested test cases.
    ///
    /// # Errors
    ///
    /// Same transient/terminal contract as [`DiffSource::fetch_diff`].
    async fn review(&self, chunk: &Chunk, params: &ReviewParams) -> Result<ChunkReview, WardenError>;
}

/// Delivers a terminal-task notification to one destination.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name used in logs and in [`NotificationEvent::channels`].
    fn name(&self) -> &str;

    /// Deliver `event`. Failures are logged by the caller and never retried.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Notify`] or a transport error.
    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError>;
}

//! Core types, configuration, and error handling for Warden.
//!
//! This crate provides the shared foundation used by all other Warden crates:
//! - [`WardenError`]: unified error type using `thiserror`
//! - [`WardenConfig`]: configuration loaded from `.warden.toml`
//! - The task model: [`TaskId`], [`TaskStatus`], [`TaskRecord`], [`TaskError`]
//! - Review types: [`Chunk`], [`ChunkReview`], [`ReviewStats`], [`Severity`]
//! - Capability traits the executor consumes: [`DiffSource`], [`Reviewer`],
//!   [`NotificationChannel`]

mod capability;
mod config;
mod error;
mod task;
mod types;

pub use capability::{DiffSource, NotificationChannel, Reviewer};
pub use config::{
    ChannelConfig, GitConfig, LlmConfig, NotifyConfig, QueueConfig, ReviewConfig, SmtpTls,
    WardenConfig,
};
pub use error::WardenError;
pub use task::{
    CommitRange, RepoRef, ReviewParams, RunPhase, TaskError, TaskErrorKind, TaskId, TaskOutput,
    TaskPayload, TaskRecord, TaskStatus, WorkerId,
};
pub use types::{
    ChangeType, Chunk, ChunkReview, DiffHunk, EndpointClass, FileSkip, NotificationEvent,
    NotificationSummary, OutputFormat, ReviewComment, ReviewStats, ScenarioCase, Severity,
    UnitTestCase,
};

/// A convenience `Result` type for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

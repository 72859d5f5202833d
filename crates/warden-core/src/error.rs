use std::path::PathBuf;

use crate::task::{TaskId, TaskStatus};

/// Errors that can occur across the Warden crates.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to `miette` diagnostics at the boundary.
///
/// # Examples
///
/// ```
/// use warden_core::WardenError;
///
/// let err = WardenError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WardenError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(help("check .warden.toml, or run 'warden init' to create one"))]
    Config(String),

    /// Git operation failure.
    #[error("git error: {0}")]
    Git(String),

    /// Diff or response parsing failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// LLM API or response error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Transport-level failure (connect, reset, DNS) talking to an upstream.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream asked us to slow down (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The upstream answered with a non-success HTTP status.
    #[error("upstream returned {status}: {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// An outbound call or a whole task exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Notification delivery failure.
    #[error("notification error: {0}")]
    Notify(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// No task with this id exists in the store.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A task with this id was already submitted.
    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    /// Compare-and-swap failure: the stored status was not the expected one.
    #[error("conflict on task {id}: expected {expected}, found {actual}")]
    Conflict {
        /// Task being transitioned.
        id: TaskId,
        /// Status the caller expected.
        expected: TaskStatus,
        /// Status actually stored.
        actual: TaskStatus,
    },

    /// The requested edge is not part of the task state machine, or the
    /// accompanying fields do not fit the target status.
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        /// Source status.
        from: TaskStatus,
        /// Target status.
        to: TaskStatus,
        /// What was wrong.
        reason: String,
    },

    /// The task already reached SUCCEEDED or FAILED.
    #[error("task {id} is already {status}")]
    AlreadyTerminal {
        /// Task id.
        id: TaskId,
        /// Terminal status it holds.
        status: TaskStatus,
    },

    /// A connection-pool lease outlived its maximum hold time and was
    /// reclaimed while the call was still running.
    #[error("lease leaked: {0}")]
    LeaseLeaked(String),

    /// The executor no longer accepts submissions.
    #[error("executor is shut down")]
    #[diagnostic(code(warden::shut_down))]
    ShutDown,
}

impl WardenError {
    /// Returns `true` for failures that are worth retrying: transport
    /// errors, rate limiting, per-call timeouts and 5xx responses.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::WardenError;
    ///
    /// assert!(WardenError::RateLimited("slow down".into()).is_transient());
    /// assert!(WardenError::Upstream { status: 503, message: "busy".into() }.is_transient());
    /// assert!(!WardenError::Upstream { status: 404, message: "gone".into() }.is_transient());
    /// assert!(!WardenError::Parse("bad hunk".into()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        match self {
            WardenError::Network(_) | WardenError::RateLimited(_) | WardenError::Timeout(_) => {
                true
            }
            WardenError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map an HTTP status and body to the matching error variant.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::WardenError;
    ///
    /// let err = WardenError::from_status(429, "too many requests".into());
    /// assert!(matches!(err, WardenError::RateLimited(_)));
    /// ```
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 {
            WardenError::RateLimited(message)
        } else {
            WardenError::Upstream { status, message }
        }
    }
}

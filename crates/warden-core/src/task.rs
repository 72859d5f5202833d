use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChunkReview, ReviewStats};

/// Unique identifier of a review task.
///
/// System-generated ids are random v4 UUIDs; callers may also supply their own.
///
/// # Examples
///
/// ```
/// use warden_core::TaskId;
///
/// let id = TaskId::new();
/// let parsed: TaskId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| format!("invalid task id '{s}': {e}"))
    }
}

/// Externally visible task status.
///
/// `Pending` is initial; `Succeeded` and `Failed` are terminal.
///
/// # Examples
///
/// ```
/// use warden_core::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
/// assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Failed));
/// assert_eq!(TaskStatus::Failed.to_string(), "FAILED");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker.
    Pending,
    /// Owned by a worker.
    Running,
    /// Finished with a merged result.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Returns `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether `self -> to` is an edge of the task state machine.
    ///
    /// `Pending -> Failed` exists for tasks cancelled before a worker
    /// picked them up.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Succeeded => write!(f, "SUCCEEDED"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Where the code under review lives.
///
/// Remote references are written `github:owner/repo`, `gitlab:owner/repo` or
/// `gitee:owner/repo`, or as the matching `https://` URL. Any other string is
/// taken as a local repository path.
///
/// # Examples
///
/// ```
/// use warden_core::RepoRef;
///
/// let gh: RepoRef = "github:rust-lang/rust".parse().unwrap();
/// assert!(matches!(gh, RepoRef::GitHub { .. }));
///
/// let gl: RepoRef = "https://gitlab.com/gitlab-org/gitlab".parse().unwrap();
/// assert_eq!(gl.to_string(), "gitlab:gitlab-org/gitlab");
///
/// let local: RepoRef = "./checkout".parse().unwrap();
/// assert!(matches!(local, RepoRef::Local { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RepoRef {
    /// A repository hosted on GitHub.
    #[serde(rename = "github")]
    GitHub {
        /// Owner or organisation.
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// A project hosted on GitLab.
    #[serde(rename = "gitlab")]
    GitLab {
        /// Namespace (user or group).
        owner: String,
        /// Project path.
        repo: String,
    },
    /// A repository hosted on Gitee.
    Gitee {
        /// Owner or organisation.
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// A repository on the local filesystem.
    Local {
        /// Path to the working tree or bare repository.
        path: PathBuf,
    },
}

impl RepoRef {
    /// Hosting provider prefix, `None` for local repositories.
    pub fn provider(&self) -> Option<&'static str> {
        match self {
            RepoRef::GitHub { .. } => Some("github"),
            RepoRef::GitLab { .. } => Some("gitlab"),
            RepoRef::Gitee { .. } => Some("gitee"),
            RepoRef::Local { .. } => None,
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoRef::GitHub { owner, repo } => write!(f, "github:{owner}/{repo}"),
            RepoRef::GitLab { owner, repo } => write!(f, "gitlab:{owner}/{repo}"),
            RepoRef::Gitee { owner, repo } => write!(f, "gitee:{owner}/{repo}"),
            RepoRef::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

const REMOTE_PREFIXES: [(&str, &str, &str); 3] = [
    ("github", "github:", "https://github.com/"),
    ("gitlab", "gitlab:", "https://gitlab.com/"),
    ("gitee", "gitee:", "https://gitee.com/"),
];

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty repository reference".into());
        }

        let remote = REMOTE_PREFIXES.iter().find_map(|(provider, short, url)| {
            s.strip_prefix(short)
                .or_else(|| s.strip_prefix(url))
                .map(|rest| (*provider, rest))
        });
        let Some((provider, remote)) = remote else {
            return Ok(RepoRef::Local {
                path: PathBuf::from(s),
            });
        };

        let remote = remote.trim_end_matches('/').trim_end_matches(".git");
        let invalid = || format!("invalid {provider} reference '{s}', expected {provider}:owner/repo");
        let (owner, repo) = remote.split_once('/').ok_or_else(|| invalid())?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid());
        }

        let (owner, repo) = (owner.to_string(), repo.to_string());
        Ok(match provider {
            "gitlab" => RepoRef::GitLab { owner, repo },
            "gitee" => RepoRef::Gitee { owner, repo },
            _ => RepoRef::GitHub { owner, repo },
        })
    }
}

/// A commit range `base..head` to diff.
///
/// # Examples
///
/// ```
/// use warden_core::CommitRange;
///
/// let range: CommitRange = "main..feature/login".parse().unwrap();
/// assert_eq!(range.base, "main");
/// assert_eq!(range.head, "feature/login");
///
/// let three_dot: CommitRange = "v1.0...v1.1".parse().unwrap();
/// assert_eq!(three_dot.head, "v1.1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRange {
    /// Base revision (branch, tag or SHA).
    pub base: String,
    /// Head revision (branch, tag or SHA).
    pub head: String,
}

impl fmt::Display for CommitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.base, self.head)
    }
}

impl FromStr for CommitRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, head) = s
            .split_once("...")
            .or_else(|| s.split_once(".."))
            .ok_or_else(|| format!("invalid commit range '{s}', expected base..head"))?;
        let (base, head) = (base.trim(), head.trim());
        if base.is_empty() || head.is_empty() {
            return Err(format!("invalid commit range '{s}', expected base..head"));
        }
        Ok(Self {
            base: base.to_string(),
            head: head.to_string(),
        })
    }
}

/// Per-task review options, handed to the reviewer as its prompt configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewParams {
    /// Also synthesize unit tests for the changed code.
    #[serde(default)]
    pub unit_tests: bool,
    /// Also synthesize scenario (functional) test cases.
    #[serde(default)]
    pub scenarios: bool,
    /// Extra reviewer instructions appended to the prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Everything a worker needs to run one review task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Repository to fetch the diff from.
    pub repo: RepoRef,
    /// Commit range to diff.
    pub range: CommitRange,
    /// Review options.
    #[serde(default)]
    pub params: ReviewParams,
}

/// Identifier of an executor worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Internal progress of a `Running` task.
///
/// `Retrying` is the sub-state of the `RUNNING -> RETRYING -> RUNNING`
/// loop; it never surfaces as a [`TaskStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum RunPhase {
    /// Waiting on the Git provider.
    FetchingDiff,
    /// Chunks are being reviewed.
    Reviewing {
        /// Chunks with a result.
        completed: usize,
        /// Total chunks.
        total: usize,
    },
    /// Backing off before another attempt of an outbound call.
    Retrying {
        /// Name of the operation being retried.
        operation: String,
        /// The attempt that is about to run.
        attempt: u32,
    },
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::FetchingDiff => write!(f, "fetching diff"),
            RunPhase::Reviewing { completed, total } => {
                write!(f, "reviewing chunk {completed}/{total}")
            }
            RunPhase::Retrying { operation, attempt } => {
                write!(f, "retrying {operation} (attempt {attempt})")
            }
        }
    }
}

/// Task-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// The diff could not be fetched.
    #[serde(rename = "UpstreamFetchError")]
    UpstreamFetch,
    /// A chunk review failed after retries.
    #[serde(rename = "UpstreamReviewError")]
    UpstreamReview,
    /// A scheduling invariant was violated (store conflict, panic, leak).
    #[serde(rename = "InternalSchedulingError")]
    InternalScheduling,
    /// The task was cancelled by a caller.
    #[serde(rename = "CancellationError")]
    Cancelled,
    /// A per-call or per-task time budget was exceeded.
    #[serde(rename = "TimeoutError")]
    Timeout,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskErrorKind::UpstreamFetch => write!(f, "UpstreamFetchError"),
            TaskErrorKind::UpstreamReview => write!(f, "UpstreamReviewError"),
            TaskErrorKind::InternalScheduling => write!(f, "InternalSchedulingError"),
            TaskErrorKind::Cancelled => write!(f, "CancellationError"),
            TaskErrorKind::Timeout => write!(f, "TimeoutError"),
        }
    }
}

/// Error recorded on a `Failed` task.
///
/// # Examples
///
/// ```
/// use warden_core::{TaskError, TaskErrorKind};
///
/// let err = TaskError::new(TaskErrorKind::UpstreamReview, "LLM error: bad gateway")
///     .with_chunk(2)
///     .with_attempts(3);
/// assert_eq!(err.chunk_index, Some(2));
/// assert!(err.to_string().contains("chunk 2"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Error class.
    pub kind: TaskErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Index of the chunk that failed, when the failure is chunk-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    /// Attempts made by the failing operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl TaskError {
    /// Create an error with no chunk or attempt annotation.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chunk_index: None,
            attempts: None,
        }
    }

    /// Annotate with the failing chunk index.
    pub fn with_chunk(mut self, index: usize) -> Self {
        self.chunk_index = Some(index);
        self
    }

    /// Annotate with the number of attempts made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(index) = self.chunk_index {
            write!(f, " (chunk {index})")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(attempts) = self.attempts {
            write!(f, " after {attempts} attempt(s)")?;
        }
        Ok(())
    }
}

/// Merged output of a succeeded task; chunks are in diff order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    /// Per-chunk results, index `i` at position `i`.
    pub chunks: Vec<ChunkReview>,
    /// Aggregate statistics.
    pub stats: ReviewStats,
}

/// The store's view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Task id.
    pub id: TaskId,
    /// What to review.
    pub payload: TaskPayload,
    /// Current status.
    pub status: TaskStatus,
    /// Progress detail while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Set iff `status == Succeeded`.
    pub result: Option<TaskOutput>,
    /// Set iff `status == Failed`.
    pub error: Option<TaskError>,
    /// Retries scheduled across all outbound calls of this task.
    pub retry_count: u32,
    /// Worker that owns (or owned) the task.
    pub worker: Option<WorkerId>,
    /// Cooperative cancellation flag.
    pub cancel_requested: bool,
}

impl TaskRecord {
    /// A fresh `Pending` record.
    pub fn new(id: TaskId, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            phase: None,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            retry_count: 0,
            worker: None,
            cancel_requested: false,
        }
    }

    /// Returns `true` once the task is `Succeeded` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use TaskStatus::*;
        let all = [Pending, Running, Succeeded, Failed];
        let allowed = [
            (Pending, Running),
            (Pending, Failed),
            (Running, Succeeded),
            (Running, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }

    #[test]
    fn parse_github_url_reference() {
        let repo: RepoRef = "https://github.com/octocat/hello-world.git".parse().unwrap();
        assert_eq!(
            repo,
            RepoRef::GitHub {
                owner: "octocat".into(),
                repo: "hello-world".into()
            }
        );
    }

    #[test]
    fn parse_gitlab_and_gitee_references() {
        let gl: RepoRef = "gitlab:group/project".parse().unwrap();
        assert_eq!(
            gl,
            RepoRef::GitLab {
                owner: "group".into(),
                repo: "project".into()
            }
        );
        let ee: RepoRef = "https://gitee.com/openharmony/docs.git".parse().unwrap();
        assert_eq!(
            ee,
            RepoRef::Gitee {
                owner: "openharmony".into(),
                repo: "docs".into()
            }
        );
        assert_eq!(ee.provider(), Some("gitee"));
        assert!("gitlab:lonely".parse::<RepoRef>().is_err());
    }

    #[test]
    fn repo_ref_serializes_with_provider_kind() {
        let gl: RepoRef = "gitlab:group/project".parse().unwrap();
        let json = serde_json::to_value(&gl).unwrap();
        assert_eq!(json["kind"], "gitlab");
        let back: RepoRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, gl);
    }

    #[test]
    fn parse_github_reference_missing_repo() {
        assert!("github:octocat".parse::<RepoRef>().is_err());
        assert!("github:octocat/".parse::<RepoRef>().is_err());
        assert!("".parse::<RepoRef>().is_err());
    }

    #[test]
    fn parse_commit_range_rejects_garbage() {
        assert!("main".parse::<CommitRange>().is_err());
        assert!("..head".parse::<CommitRange>().is_err());
        assert!("base..".parse::<CommitRange>().is_err());
    }

    #[test]
    fn task_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn error_kind_uses_taxonomy_names() {
        let json = serde_json::to_string(&TaskErrorKind::UpstreamFetch).unwrap();
        assert_eq!(json, "\"UpstreamFetchError\"");
        assert_eq!(TaskErrorKind::Cancelled.to_string(), "CancellationError");
    }

    #[test]
    fn new_record_is_pending_and_empty() {
        let payload = TaskPayload {
            repo: "github:a/b".parse().unwrap(),
            range: "main..dev".parse().unwrap(),
            params: ReviewParams::default(),
        };
        let record = TaskRecord::new(TaskId::new(), payload);
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert_eq!(record.retry_count, 0);
        assert!(!record.is_terminal());
    }
}

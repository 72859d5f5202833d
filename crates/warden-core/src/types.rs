use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::{CommitRange, RepoRef, TaskError, TaskId, TaskStatus};

/// A single hunk from a unified diff.
///
/// # Examples
///
/// ```
/// use warden_core::{DiffHunk, ChangeType};
/// use std::path::PathBuf;
///
/// let hunk = DiffHunk {
///     file_path: PathBuf::from("src/lib.rs"),
///     old_start: 10,
///     old_lines: 5,
///     new_start: 10,
///     new_lines: 8,
///     content: "+ new line\n- old line".into(),
///     change_type: ChangeType::Modify,
/// };
/// assert_eq!(hunk.old_lines, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    /// Path to the affected file.
    pub file_path: PathBuf,
    /// Starting line in the old version.
    pub old_start: u32,
    /// Number of lines in the old version.
    pub old_lines: u32,
    /// Starting line in the new version.
    pub new_start: u32,
    /// Number of lines in the new version.
    pub new_lines: u32,
    /// Raw diff content for this hunk.
    pub content: String,
    /// Classification of the change.
    pub change_type: ChangeType,
}

/// Classification of a diff hunk.
///
/// # Examples
///
/// ```
/// use warden_core::ChangeType;
///
/// assert_eq!(format!("{}", ChangeType::Add), "add");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// New file or code added.
    Add,
    /// Existing file or code removed.
    Delete,
    /// Existing code modified in place.
    Modify,
    /// File renamed.
    Move,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Modify => write!(f, "modify"),
            ChangeType::Move => write!(f, "move"),
        }
    }
}

/// Issue severity level for review comments.
///
/// # Examples
///
/// ```
/// use warden_core::Severity;
///
/// let s: Severity = serde_json::from_str("\"bug\"").unwrap();
/// assert_eq!(s, Severity::Bug);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A likely defect that should be fixed.
    Bug,
    /// A potential issue worth investigating.
    Warning,
    /// An optional improvement.
    Suggestion,
    /// Informational observation.
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Bug => write!(f, "bug"),
            Severity::Warning => write!(f, "warning"),
            Severity::Suggestion => write!(f, "suggestion"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bug" => Ok(Severity::Bug),
            "warning" => Ok(Severity::Warning),
            "suggestion" => Ok(Severity::Suggestion),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Severity {
    /// Returns `true` if `self` is at least as severe as `threshold`.
    ///
    /// Severity order: Bug > Warning > Suggestion > Info.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::Severity;
    ///
    /// assert!(Severity::Bug.meets_threshold(Severity::Warning));
    /// assert!(!Severity::Suggestion.meets_threshold(Severity::Warning));
    /// ```
    pub fn meets_threshold(self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }

    fn rank(self) -> u8 {
        match self {
            Severity::Bug => 0,
            Severity::Warning => 1,
            Severity::Suggestion => 2,
            Severity::Info => 3,
        }
    }
}

/// A single review comment produced by the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewComment {
    /// Path to the file being commented on.
    pub file_path: PathBuf,
    /// Line number in the new version of the file.
    pub line: u32,
    /// Severity of the finding.
    pub severity: Severity,
    /// Explanation of the issue.
    pub message: String,
    /// Self-rated confidence (0-100).
    pub confidence: f64,
    /// Optional fix suggestion.
    pub suggestion: Option<String>,
}

/// A unit test proposed for the changed code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitTestCase {
    /// File the test targets.
    pub file_path: PathBuf,
    /// Short test name.
    pub name: String,
    /// Test source code.
    pub code: String,
}

/// A functional scenario test case, written as steps and an expectation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioCase {
    /// Scenario title.
    pub title: String,
    /// Preconditions, if any.
    #[serde(default)]
    pub preconditions: Option<String>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Expected outcome.
    pub expected: String,
}

/// A size-bounded slice of a diff, reviewed by one LLM call.
///
/// Chunks are cut at hunk boundaries, so `text` is always a valid unified
/// diff fragment with its file headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Position in the task's chunk sequence, starting at 0.
    pub index: usize,
    /// Files whose hunks appear in this chunk, in diff order.
    pub files: Vec<PathBuf>,
    /// Number of hunks in this chunk.
    pub hunk_count: usize,
    /// Rendered diff text.
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub fingerprint: String,
}

/// Reviewer output for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReview {
    /// Index of the reviewed chunk.
    pub index: usize,
    /// Files covered by the chunk.
    pub files: Vec<PathBuf>,
    /// Fingerprint of the reviewed chunk.
    pub fingerprint: String,
    /// Review comments that passed the confidence filter.
    pub comments: Vec<ReviewComment>,
    /// One-paragraph summary of the chunk.
    #[serde(default)]
    pub summary: Option<String>,
    /// Generated unit tests.
    #[serde(default)]
    pub unit_tests: Vec<UnitTestCase>,
    /// Generated scenario test cases.
    #[serde(default)]
    pub scenarios: Vec<ScenarioCase>,
}

/// A file dropped by the noise filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSkip {
    /// Path of the skipped file.
    pub path: PathBuf,
    /// Human-readable reason.
    pub reason: String,
}

/// Aggregate statistics for a review task.
///
/// # Examples
///
/// ```
/// use warden_core::{ChunkReview, ReviewStats};
///
/// let mut stats = ReviewStats::default();
/// stats.absorb(&ChunkReview::default());
/// assert_eq!(stats.comments_total(), 0);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    /// Files that reached the reviewer.
    pub files_reviewed: usize,
    /// Files dropped by the noise filter.
    pub files_skipped: Vec<FileSkip>,
    /// Chunks reviewed.
    pub chunks: usize,
    /// Hunks across all chunks.
    pub hunks: usize,
    /// Reviewer calls that succeeded.
    pub llm_calls: usize,
    /// Bug-level comments.
    pub bugs: usize,
    /// Warning-level comments.
    pub warnings: usize,
    /// Suggestion-level comments.
    pub suggestions: usize,
    /// Info-level comments.
    pub infos: usize,
    /// Unit tests generated.
    pub unit_tests: usize,
    /// Scenario cases generated.
    pub scenarios: usize,
    /// Model identifier reported by the reviewer.
    pub model_used: String,
}

impl ReviewStats {
    /// Fold one chunk's output into the counters.
    pub fn absorb(&mut self, review: &ChunkReview) {
        self.llm_calls += 1;
        for comment in &review.comments {
            match comment.severity {
                Severity::Bug => self.bugs += 1,
                Severity::Warning => self.warnings += 1,
                Severity::Suggestion => self.suggestions += 1,
                Severity::Info => self.infos += 1,
            }
        }
        self.unit_tests += review.unit_tests.len();
        self.scenarios += review.scenarios.len();
    }

    /// Total comments across severities.
    pub fn comments_total(&self) -> usize {
        self.bugs + self.warnings + self.suggestions + self.infos
    }
}

/// Outbound endpoint classes, each with its own concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    /// Git provider (diff fetch).
    Git,
    /// LLM backend.
    Llm,
    /// Notification transports.
    Notify,
}

impl EndpointClass {
    /// All classes, in a stable order.
    pub const ALL: [EndpointClass; 3] = [EndpointClass::Git, EndpointClass::Llm, EndpointClass::Notify];

    /// Config key of this class.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Git => "git",
            EndpointClass::Llm => "llm",
            EndpointClass::Notify => "notify",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-facing summary attached to a [`NotificationEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    /// One-line title.
    pub title: String,
    /// Markdown body.
    pub body: String,
    /// Reviewed repository.
    pub repo: RepoRef,
    /// Reviewed range.
    pub range: CommitRange,
    /// Failure details, for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Statistics, for succeeded tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReviewStats>,
}

/// Emitted exactly once per task when it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Task that finished.
    pub task_id: TaskId,
    /// `Succeeded` or `Failed`.
    pub outcome: TaskStatus,
    /// Summary payload.
    pub summary: NotificationSummary,
    /// Names of the channels this event is routed to.
    pub channels: Vec<String>,
}

/// Output format for CLI subcommands.
///
/// # Examples
///
/// ```
/// use warden_core::OutputFormat;
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

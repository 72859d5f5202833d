use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;
use crate::types::{EndpointClass, Severity};

/// Top-level configuration loaded from `.warden.toml`.
///
/// Every table is optional; missing fields take the documented defaults.
///
/// # Examples
///
/// ```
/// use warden_core::WardenConfig;
///
/// let config = WardenConfig::default();
/// assert_eq!(config.queue.max_retry_attempts, 3);
/// assert!(config.notify.channels.is_empty());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Git provider settings.
    #[serde(default)]
    pub git: GitConfig,
    /// Review behavior settings.
    #[serde(default)]
    pub review: ReviewConfig,
    /// Executor, pool and retry settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Notification channels.
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl WardenConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Io`] if the file cannot be read,
    /// [`WardenError::Toml`] if the content is not valid TOML, or
    /// [`WardenError::Config`] if the queue settings are out of range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use warden_core::WardenConfig;
    /// use std::path::Path;
    ///
    /// let config = WardenConfig::from_file(Path::new(".warden.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, WardenError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Toml`] if parsing fails or
    /// [`WardenError::Config`] if validation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::WardenConfig;
    ///
    /// let toml = r#"
    /// [queue]
    /// max_concurrent_tasks = 8
    /// "#;
    /// let config = WardenConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.queue.max_concurrent_tasks, 8);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, WardenError> {
        let config: Self = toml::from_str(content)?;
        config.queue.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise `.warden.toml` in the current
    /// directory if present, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::FileNotFound`] if an explicit `path` does not
    /// exist, plus anything [`WardenConfig::from_file`] returns.
    pub fn load(path: Option<&Path>) -> Result<Self, WardenError> {
        match path {
            Some(p) if !p.exists() => Err(WardenError::FileNotFound(p.to_path_buf())),
            Some(p) => Self::from_file(p),
            None => {
                let local = Path::new(".warden.toml");
                if local.exists() {
                    Self::from_file(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// LLM provider configuration (OpenAI-compatible chat completions).
///
/// # Examples
///
/// ```
/// use warden_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key; falls back to `WARDEN_LLM_API_KEY` then `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_temperature() -> f64 {
    0.1
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    /// The configured key, or the first of the fallback environment variables that is set.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("WARDEN_LLM_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

/// Git provider configuration.
///
/// Each hosting provider has its own token and API base. Tokens fall back to
/// `GITHUB_TOKEN`, `GITLAB_TOKEN` and `GITEE_TOKEN` respectively.
///
/// # Examples
///
/// ```
/// use warden_core::GitConfig;
///
/// let config = GitConfig::default();
/// assert_eq!(config.api_base, "https://api.github.com");
/// assert_eq!(config.gitlab_api_base, "https://gitlab.com/api/v4");
/// assert_eq!(config.gitee_api_base, "https://gitee.com/api/v5");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// GitHub token; falls back to `GITHUB_TOKEN`.
    pub token: Option<String>,
    /// GitHub REST API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// GitLab token; falls back to `GITLAB_TOKEN`.
    #[serde(default)]
    pub gitlab_token: Option<String>,
    /// GitLab REST API base URL.
    #[serde(default = "default_gitlab_api_base")]
    pub gitlab_api_base: String,
    /// Gitee token; falls back to `GITEE_TOKEN`.
    #[serde(default)]
    pub gitee_token: Option<String>,
    /// Gitee REST API base URL.
    #[serde(default = "default_gitee_api_base")]
    pub gitee_api_base: String,
}

fn default_api_base() -> String {
    "https://api.github.com".into()
}

fn default_gitlab_api_base() -> String {
    "https://gitlab.com/api/v4".into()
}

fn default_gitee_api_base() -> String {
    "https://gitee.com/api/v5".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
            gitlab_token: None,
            gitlab_api_base: default_gitlab_api_base(),
            gitee_token: None,
            gitee_api_base: default_gitee_api_base(),
        }
    }
}

fn token_or_env(token: &Option<String>, var: &str) -> Option<String> {
    token
        .clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|t| !t.is_empty())
}

impl GitConfig {
    /// The configured token or `GITHUB_TOKEN`.
    pub fn resolve_token(&self) -> Option<String> {
        token_or_env(&self.token, "GITHUB_TOKEN")
    }

    /// The configured GitLab token or `GITLAB_TOKEN`.
    pub fn resolve_gitlab_token(&self) -> Option<String> {
        token_or_env(&self.gitlab_token, "GITLAB_TOKEN")
    }

    /// The configured Gitee token or `GITEE_TOKEN`.
    pub fn resolve_gitee_token(&self) -> Option<String> {
        token_or_env(&self.gitee_token, "GITEE_TOKEN")
    }
}

/// Review behavior configuration.
///
/// # Examples
///
/// ```
/// use warden_core::ReviewConfig;
///
/// let config = ReviewConfig::default();
/// assert_eq!(config.min_confidence, 80.0);
/// assert_eq!(config.max_file_lines, 1000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Maximum comments kept per chunk (default: 10).
    #[serde(default = "default_max_comments")]
    pub max_comments: usize,
    /// Minimum reviewer confidence to keep a comment (default: 80.0).
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Only keep comments at these severity levels.
    #[serde(default = "default_severity_filter")]
    pub severity_filter: Vec<Severity>,
    /// Additional glob patterns to skip before review.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    /// Additional file extensions to skip before review.
    #[serde(default)]
    pub skip_extensions: Vec<String>,
    /// Files with more changed lines than this are skipped (default: 1000).
    #[serde(default = "default_max_file_lines")]
    pub max_file_lines: usize,
}

fn default_max_comments() -> usize {
    10
}

fn default_min_confidence() -> f64 {
    80.0
}

fn default_severity_filter() -> Vec<Severity> {
    vec![Severity::Bug, Severity::Warning, Severity::Suggestion]
}

fn default_max_file_lines() -> usize {
    1000
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_comments: default_max_comments(),
            min_confidence: default_min_confidence(),
            severity_filter: default_severity_filter(),
            skip_patterns: Vec::new(),
            skip_extensions: Vec::new(),
            max_file_lines: default_max_file_lines(),
        }
    }
}

/// Executor, connection pool and retry configuration.
///
/// # Examples
///
/// ```
/// use warden_core::{EndpointClass, QueueConfig};
///
/// let mut config = QueueConfig::default();
/// config.endpoint_limits.insert("llm".into(), 2);
/// assert_eq!(config.limit_for(EndpointClass::Llm), 2);
/// assert_eq!(config.limit_for(EndpointClass::Git), 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker pool size (default: 4).
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Concurrent outbound calls per endpoint class (default: 10).
    #[serde(default = "default_calls_per_class")]
    pub max_concurrent_calls_per_endpoint_class: usize,
    /// Per-class overrides keyed by `git`, `llm` or `notify`.
    #[serde(default)]
    pub endpoint_limits: BTreeMap<String, usize>,
    /// Attempts per outbound call, first try included (default: 3).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Base backoff delay (default: 500 ms).
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Backoff cap (default: 30 s).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Budget for a single outbound call (default: 120 s).
    #[serde(default = "default_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    /// Wall-clock budget for a whole task (default: 30 min).
    #[serde(default = "default_per_task_timeout_ms")]
    pub per_task_timeout_ms: u64,
    /// Maximum characters per chunk (default: 12000).
    #[serde(default = "default_chunk_size_limit")]
    pub chunk_size_limit: usize,
    /// Chunks of one task reviewed concurrently (default: 4).
    #[serde(default = "default_chunk_parallelism")]
    pub chunk_parallelism: usize,
    /// A lease held longer than this is force-released as a leak (default: 10 min).
    #[serde(default = "default_lease_max_hold_ms")]
    pub lease_max_hold_ms: u64,
    /// Terminal tasks older than this are purged (default: 3600 s).
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_calls_per_class() -> usize {
    10
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_per_call_timeout_ms() -> u64 {
    120_000
}

fn default_per_task_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_chunk_size_limit() -> usize {
    12_000
}

fn default_chunk_parallelism() -> usize {
    4
}

fn default_lease_max_hold_ms() -> u64 {
    10 * 60 * 1000
}

fn default_result_ttl_secs() -> u64 {
    3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_calls_per_endpoint_class: default_calls_per_class(),
            endpoint_limits: BTreeMap::new(),
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            per_call_timeout_ms: default_per_call_timeout_ms(),
            per_task_timeout_ms: default_per_task_timeout_ms(),
            chunk_size_limit: default_chunk_size_limit(),
            chunk_parallelism: default_chunk_parallelism(),
            lease_max_hold_ms: default_lease_max_hold_ms(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

impl QueueConfig {
    /// Concurrency limit for `class`, honouring per-class overrides.
    pub fn limit_for(&self, class: EndpointClass) -> usize {
        self.endpoint_limits
            .get(class.as_str())
            .copied()
            .unwrap_or(self.max_concurrent_calls_per_endpoint_class)
    }

    /// All per-class limits.
    pub fn limits(&self) -> HashMap<EndpointClass, usize> {
        EndpointClass::ALL
            .iter()
            .map(|c| (*c, self.limit_for(*c)))
            .collect()
    }

    /// Base backoff as a [`Duration`].
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Backoff cap as a [`Duration`].
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Per-call timeout as a [`Duration`].
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    /// Per-task timeout as a [`Duration`].
    pub fn per_task_timeout(&self) -> Duration {
        Duration::from_millis(self.per_task_timeout_ms)
    }

    /// Lease leak threshold as a [`Duration`].
    pub fn lease_max_hold(&self) -> Duration {
        Duration::from_millis(self.lease_max_hold_ms)
    }

    /// Result TTL as a [`Duration`].
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// Reject zero limits, zero budgets, inverted backoff bounds and unknown
    /// endpoint classes.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] describing the first offending field.
    pub fn validate(&self) -> Result<(), WardenError> {
        let positive = [
            ("max_concurrent_tasks", self.max_concurrent_tasks as u64),
            (
                "max_concurrent_calls_per_endpoint_class",
                self.max_concurrent_calls_per_endpoint_class as u64,
            ),
            ("max_retry_attempts", u64::from(self.max_retry_attempts)),
            ("per_call_timeout_ms", self.per_call_timeout_ms),
            ("per_task_timeout_ms", self.per_task_timeout_ms),
            ("chunk_size_limit", self.chunk_size_limit as u64),
            ("chunk_parallelism", self.chunk_parallelism as u64),
            ("lease_max_hold_ms", self.lease_max_hold_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(WardenError::Config(format!(
                    "queue.{field} must be greater than zero"
                )));
            }
        }

        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(WardenError::Config(format!(
                "queue.base_backoff_ms ({}) exceeds queue.max_backoff_ms ({})",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }

        for (key, limit) in &self.endpoint_limits {
            if !EndpointClass::ALL.iter().any(|c| c.as_str() == key) {
                return Err(WardenError::Config(format!(
                    "queue.endpoint_limits: unknown endpoint class '{key}' (expected git, llm or notify)"
                )));
            }
            if *limit == 0 {
                return Err(WardenError::Config(format!(
                    "queue.endpoint_limits.{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Channels every terminal event is sent to.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// One notification channel, selected by `kind`.
///
/// # Examples
///
/// ```
/// use warden_core::{ChannelConfig, WardenConfig};
///
/// let toml = r#"
/// [[notify.channels]]
/// kind = "wechat_work"
/// webhook_url = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=abc"
/// mentioned_list = ["@all"]
/// "#;
/// let config = WardenConfig::from_toml(toml).unwrap();
/// assert!(matches!(config.notify.channels[0], ChannelConfig::WechatWork { .. }));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Write the event to the log.
    Log,
    /// POST the event as JSON.
    Webhook {
        /// Target URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// WeChat Work group robot, markdown message.
    WechatWork {
        /// Robot webhook URL.
        webhook_url: String,
        /// User ids to mention.
        #[serde(default)]
        mentioned_list: Vec<String>,
        /// Mobile numbers to mention.
        #[serde(default)]
        mentioned_mobile_list: Vec<String>,
    },
    /// Comment on the head commit of a GitHub repository.
    GithubCommitComment {
        /// Token; falls back to `[git].token` and `GITHUB_TOKEN`.
        #[serde(default)]
        token: Option<String>,
    },
    /// Plain-text mail over SMTP.
    Email {
        /// SMTP relay host.
        smtp_host: String,
        /// SMTP port.
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        /// Login user; also the sender address when `from` is unset.
        #[serde(default)]
        username: Option<String>,
        /// Login password; falls back to `WARDEN_SMTP_PASSWORD`.
        #[serde(default)]
        password: Option<String>,
        /// Sender address.
        #[serde(default)]
        from: Option<String>,
        /// Sender display name.
        #[serde(default = "default_from_name")]
        from_name: String,
        /// Recipient addresses.
        to: Vec<String>,
        /// Transport security.
        #[serde(default)]
        tls: SmtpTls,
    },
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "Warden".into()
}

/// How the email channel secures its SMTP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpTls {
    /// Plain connection upgraded with `STARTTLS`.
    #[default]
    Starttls,
    /// Implicit TLS from the first byte, usually port 465.
    Tls,
    /// No encryption, for local relays only.
    None,
}

impl ChannelConfig {
    /// Channel name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelConfig::Log => "log",
            ChannelConfig::Webhook { .. } => "webhook",
            ChannelConfig::WechatWork { .. } => "wechat_work",
            ChannelConfig::GithubCommitComment { .. } => "github_commit_comment",
            ChannelConfig::Email { .. } => "email",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = WardenConfig::default();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.git.api_base, "https://api.github.com");
        assert_eq!(config.review.max_comments, 10);
        assert_eq!(config.queue.max_concurrent_tasks, 4);
        assert_eq!(config.queue.max_concurrent_calls_per_endpoint_class, 10);
        assert_eq!(config.queue.max_retry_attempts, 3);
        assert_eq!(config.queue.result_ttl_secs, 3600);
        assert!(config.queue.validate().is_ok());
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config.queue.chunk_size_limit, 12_000);
        assert_eq!(config.llm.model, "gpt-4o");
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(WardenConfig::from_toml("{{invalid}}").is_err());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[llm]
model = "gpt-4o-mini"
base_url = "http://localhost:11434/v1"

[git]
token = "ghp_test"

[review]
min_confidence = 90.0
severity_filter = ["bug"]
skip_patterns = ["fixtures/**"]

[queue]
max_concurrent_tasks = 2
max_concurrent_calls_per_endpoint_class = 5
max_retry_attempts = 5
base_backoff_ms = 100
max_backoff_ms = 2000

[queue.endpoint_limits]
llm = 3

[[notify.channels]]
kind = "log"

[[notify.channels]]
kind = "webhook"
url = "https://hooks.example.com/review"
headers = { "X-Token" = "secret" }

[[notify.channels]]
kind = "github_commit_comment"
"#;
        let config = WardenConfig::from_toml(toml).unwrap();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.git.token.as_deref(), Some("ghp_test"));
        assert_eq!(config.review.severity_filter, vec![Severity::Bug]);
        assert_eq!(config.queue.max_concurrent_tasks, 2);
        assert_eq!(config.queue.limit_for(EndpointClass::Llm), 3);
        assert_eq!(config.queue.limit_for(EndpointClass::Git), 5);
        assert_eq!(config.queue.base_backoff(), Duration::from_millis(100));

        let names: Vec<&str> = config.notify.channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["log", "webhook", "github_commit_comment"]);
        match &config.notify.channels[1] {
            ChannelConfig::Webhook { headers, .. } => {
                assert_eq!(headers.get("X-Token").map(String::as_str), Some("secret"));
            }
            other => panic!("expected webhook, got {other:?}"),
        }
    }

    #[test]
    fn email_channel_defaults() {
        let toml = r#"
[[notify.channels]]
kind = "email"
smtp_host = "smtp.example.com"
username = "bot@example.com"
to = ["dev@example.com"]
"#;
        let config = WardenConfig::from_toml(toml).unwrap();
        match &config.notify.channels[0] {
            ChannelConfig::Email {
                smtp_port,
                from_name,
                tls,
                password,
                ..
            } => {
                assert_eq!(*smtp_port, 587);
                assert_eq!(from_name, "Warden");
                assert_eq!(*tls, SmtpTls::Starttls);
                assert!(password.is_none());
            }
            other => panic!("expected email, got {other:?}"),
        }
        assert_eq!(config.notify.channels[0].name(), "email");

        let implicit = WardenConfig::from_toml(
            "[[notify.channels]]\nkind = \"email\"\nsmtp_host = \"h\"\nsmtp_port = 465\ntls = \"tls\"\nto = []\n",
        )
        .unwrap();
        assert!(matches!(
            implicit.notify.channels[0],
            ChannelConfig::Email {
                smtp_port: 465,
                tls: SmtpTls::Tls,
                ..
            }
        ));
    }

    #[test]
    fn zero_limits_rejected() {
        let err = WardenConfig::from_toml("[queue]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_tasks"));

        let err = WardenConfig::from_toml("[queue]\nmax_retry_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_retry_attempts"));
    }

    #[test]
    fn inverted_backoff_rejected() {
        let config = QueueConfig {
            base_backoff_ms: 5000,
            max_backoff_ms: 1000,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_endpoint_class_rejected() {
        let err = WardenConfig::from_toml("[queue.endpoint_limits]\nsmtp = 2\n").unwrap_err();
        assert!(err.to_string().contains("smtp"));
    }

    #[test]
    fn explicit_api_key_wins() {
        let config = LlmConfig {
            api_key: Some("sk-explicit".into()),
            ..LlmConfig::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn load_missing_explicit_path_is_not_found() {
        let err = WardenConfig::load(Some(Path::new("/nonexistent/.warden.toml"))).unwrap_err();
        assert!(matches!(err, WardenError::FileNotFound(_)));
    }
}

//! Notification transports.
//!
//! Each channel delivers one [`NotificationEvent`]; the dispatcher handles
//! fan-out, timeouts and logging of failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use warden_core::{
    ChannelConfig, GitConfig, NotificationChannel, NotificationEvent, RepoRef, SmtpTls,
    TaskStatus, WardenError,
};

use crate::github::GitHubClient;

/// WeChat Work rejects markdown bodies over 4096 bytes.
const WECHAT_MAX_BYTES: usize = 4096;

/// Writes events to the log.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        tracing::info!(
            task_id = %event.task_id,
            outcome = %event.outcome,
            repo = %event.summary.repo,
            range = %event.summary.range,
            "{}",
            event.summary.title
        );
        Ok(())
    }
}

/// POSTs the event as JSON to a URL.
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookChannel {
    /// Create a webhook channel.
    pub fn new(http: reqwest::Client, url: String, headers: HashMap<String, String>) -> Self {
        Self { http, url, headers }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        let mut request = self.http.post(&self.url).json(event);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| WardenError::Notify(format!("webhook {}: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::Notify(format!(
                "webhook {} returned {status}",
                self.url
            )));
        }
        Ok(())
    }
}

/// WeChat Work group robot, markdown message with mentions.
pub struct WechatWorkChannel {
    http: reqwest::Client,
    webhook_url: String,
    mentioned_list: Vec<String>,
    mentioned_mobile_list: Vec<String>,
}

impl WechatWorkChannel {
    /// Create a WeChat Work channel.
    pub fn new(
        http: reqwest::Client,
        webhook_url: String,
        mentioned_list: Vec<String>,
        mentioned_mobile_list: Vec<String>,
    ) -> Self {
        Self {
            http,
            webhook_url,
            mentioned_list,
            mentioned_mobile_list,
        }
    }

    fn payload(&self, event: &NotificationEvent) -> serde_json::Value {
        let icon = match event.outcome {
            TaskStatus::Succeeded => "\u{2705}",
            _ => "\u{274c}",
        };
        let content = format!(
            "{icon} **{}**\n\n{}",
            event.summary.title, event.summary.body
        );
        serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "content": truncate_utf8(&content, WECHAT_MAX_BYTES),
                "mentioned_list": self.mentioned_list,
                "mentioned_mobile_list": self.mentioned_mobile_list,
            }
        })
    }
}

#[async_trait]
impl NotificationChannel for WechatWorkChannel {
    fn name(&self) -> &str {
        "wechat_work"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&self.payload(event))
            .send()
            .await
            .map_err(|e| WardenError::Notify(format!("wechat_work: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::Notify(format!("wechat_work returned {status}")));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WardenError::Notify(format!("wechat_work: unreadable response: {e}")))?;
        match body.get("errcode").and_then(|c| c.as_i64()) {
            Some(0) => Ok(()),
            _ => Err(WardenError::Notify(format!(
                "wechat_work API error: {}",
                body.get("errmsg").and_then(|m| m.as_str()).unwrap_or("unknown")
            ))),
        }
    }
}

/// Posts the summary as a comment on the head commit of a GitHub repository.
/// Events for local repositories are ignored.
pub struct GitHubCommitCommentChannel {
    client: GitHubClient,
}

impl GitHubCommitCommentChannel {
    /// Create the channel around a GitHub client.
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationChannel for GitHubCommitCommentChannel {
    fn name(&self) -> &str {
        "github_commit_comment"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        let RepoRef::GitHub { owner, repo } = &event.summary.repo else {
            tracing::debug!(task_id = %event.task_id, "not a GitHub repository, skipping commit comment");
            return Ok(());
        };
        let body = format!("### {}\n\n{}", event.summary.title, event.summary.body);
        self.client
            .comment_on_commit(owner, repo, &event.summary.range.head, &body)
            .await
    }
}

/// SMTP settings for [`EmailChannel`], taken from a `kind = "email"` entry.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Login user.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Sender address; `username` when unset.
    pub from: Option<String>,
    /// Sender display name.
    pub from_name: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Transport security.
    pub tls: SmtpTls,
}

/// Sends the summary as a plain-text mail.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailChannel {
    /// Validate the addresses and build the SMTP transport.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] when there is no sender or recipient,
    /// an address does not parse, or the relay host is rejected.
    pub fn new(settings: EmailSettings, timeout: Duration) -> Result<Self, WardenError> {
        let sender = settings
            .from
            .as_deref()
            .or(settings.username.as_deref())
            .ok_or_else(|| WardenError::Config("email channel needs `from` or `username`".into()))?;
        let from = Mailbox::new(Some(settings.from_name.clone()), parse_address(sender)?.email);
        if settings.to.is_empty() {
            return Err(WardenError::Config("email channel has no recipients".into()));
        }
        let to = settings
            .to
            .iter()
            .map(|addr| parse_address(addr))
            .collect::<Result<Vec<_>, _>>()?;

        let builder = match settings.tls {
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host),
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            }
            SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &settings.host,
            )),
        }
        .map_err(|e| WardenError::Config(format!("smtp host {}: {e}", settings.host)))?;

        let mut builder = builder.port(settings.port).timeout(Some(timeout));
        let password = settings
            .password
            .or_else(|| std::env::var("WARDEN_SMTP_PASSWORD").ok());
        if let (Some(user), Some(password)) = (settings.username, password) {
            builder = builder.credentials(Credentials::new(user, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

fn parse_address(addr: &str) -> Result<Mailbox, WardenError> {
    addr.trim()
        .parse::<Mailbox>()
        .map_err(|e| WardenError::Config(format!("invalid email address '{addr}': {e}")))
}

/// Build the mail for one event.
///
/// # Errors
///
/// Returns [`WardenError::Notify`] if the message cannot be assembled.
pub fn compose_email(
    from: &Mailbox,
    to: &[Mailbox],
    event: &NotificationEvent,
) -> Result<Message, WardenError> {
    let summary = &event.summary;
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(summary.title.as_str())
        .header(ContentType::TEXT_PLAIN);
    for recipient in to {
        builder = builder.to(recipient.clone());
    }
    let body = format!(
        "{}\n\nRepository: {}\nRange: {}\nOutcome: {}\nTask: {}\n",
        summary.body, summary.repo, summary.range, event.outcome, event.task_id
    );
    builder
        .body(body)
        .map_err(|e| WardenError::Notify(format!("email: cannot build message: {e}")))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), WardenError> {
        let message = compose_email(&self.from, &self.to, event)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| WardenError::Notify(format!("email: {e}")))?;
        Ok(())
    }
}

/// Instantiate the configured channels.
///
/// # Errors
///
/// Returns [`WardenError::Notify`] if an HTTP client cannot be built,
/// [`WardenError::Git`] if the GitHub client cannot be built, or
/// [`WardenError::Config`] for an unusable email entry.
pub fn build_channels(
    configs: &[ChannelConfig],
    git: &GitConfig,
    timeout: Duration,
) -> Result<Vec<Arc<dyn NotificationChannel>>, WardenError> {
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("warden")
        .build()
        .map_err(|e| WardenError::Notify(format!("failed to create HTTP client: {e}")))?;

    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::with_capacity(configs.len());
    for config in configs {
        let channel: Arc<dyn NotificationChannel> = match config {
            ChannelConfig::Log => Arc::new(LogChannel),
            ChannelConfig::Webhook { url, headers } => {
                Arc::new(WebhookChannel::new(http.clone(), url.clone(), headers.clone()))
            }
            ChannelConfig::WechatWork {
                webhook_url,
                mentioned_list,
                mentioned_mobile_list,
            } => Arc::new(WechatWorkChannel::new(
                http.clone(),
                webhook_url.clone(),
                mentioned_list.clone(),
                mentioned_mobile_list.clone(),
            )),
            ChannelConfig::GithubCommitComment { token } => {
                let git = GitConfig {
                    token: token.clone().or_else(|| git.token.clone()),
                    ..git.clone()
                };
                Arc::new(GitHubCommitCommentChannel::new(GitHubClient::new(&git)?))
            }
            ChannelConfig::Email {
                smtp_host,
                smtp_port,
                username,
                password,
                from,
                from_name,
                to,
                tls,
            } => Arc::new(EmailChannel::new(
                EmailSettings {
                    host: smtp_host.clone(),
                    port: *smtp_port,
                    username: username.clone(),
                    password: password.clone(),
                    from: from.clone(),
                    from_name: from_name.clone(),
                    to: to.clone(),
                    tls: *tls,
                },
                timeout,
            )?),
        };
        channels.push(channel);
    }
    Ok(channels)
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_core::{LlmConfig, WardenError};

/// A message in a chat conversation with the LLM.
///
/// # Examples
///
/// ```
/// use warden_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Review this code");
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Role in the chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider that exposes `/v1/chat/completions`: OpenAI,
/// Ollama, vLLM, LiteLLM and friends. Transport failures, HTTP 429 and 5xx
/// come back as transient [`WardenError`] variants so callers can retry them.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_core::LlmConfig;
/// use warden_review::llm::LlmClient;
///
/// let client = LlmClient::new(&LlmConfig::default(), Duration::from_secs(60)).unwrap();
/// assert_eq!(client.model(), "gpt-4o");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl LlmClient {
    /// Create a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Llm`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, WardenError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WardenError::Llm(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key: config.resolve_api_key(),
        })
    }

    /// Model name from the configuration.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    /// Send a chat completion request and return the assistant's text.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Timeout`] or [`WardenError::Network`] on
    /// transport failure, [`WardenError::RateLimited`] on 429,
    /// [`WardenError::Upstream`] on other non-success statuses, and
    /// [`WardenError::Llm`] if the response body has an unexpected shape.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, WardenError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(WardenError::from_status(
                status.as_u16(),
                format!("LLM API: {body_text}"),
            ));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WardenError::Llm(format!("failed to parse response: {e}")))?;

        extract_content(&response_body)
    }
}

/// Classify a reqwest failure. Only malformed requests are terminal.
pub(crate) fn transport_error(e: reqwest::Error) -> WardenError {
    if e.is_timeout() {
        WardenError::Timeout(e.to_string())
    } else if e.is_builder() {
        WardenError::Config(format!("invalid request: {e}"))
    } else {
        WardenError::Network(format!("request failed: {e}"))
    }
}

fn extract_content(body: &serde_json::Value) -> Result<String, WardenError> {
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| WardenError::Llm(format!("unexpected response structure: {body}")))
}

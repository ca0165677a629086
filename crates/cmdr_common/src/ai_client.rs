//! AI text-service abstraction.
//!
//! The model call is an opaque text-in/text-out collaborator. `HttpAiClient`
//! speaks the Anthropic messages API; `FakeAiClient` scripts replies for
//! tests. Neither knows anything about intents — shaping and validating the
//! reply is the intent parser's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// AI service failures. `Service` carries the upstream HTTP status so the
/// caller can distinguish auth (401), rate-limit (429), and outage (5xx).
#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("AI service returned status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("AI request failed: {0}")]
    Request(String),

    #[error("AI request timed out after {0}s")]
    Timeout(u64),

    #[error("AI returned an empty reply")]
    EmptyReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of conversation context passed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Opaque completion service.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Run one completion over the given system prompt and messages,
    /// returning the raw reply text.
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, AiError>;
}

/// AI client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Real client over the Anthropic messages API.
pub struct HttpAiClient {
    config: AiConfig,
    client: reqwest::Client,
}

impl HttpAiClient {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AiError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, AiError> {
        let api_messages: Vec<ApiMessage<'_>> = messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "system": system_prompt,
            "messages": api_messages,
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.endpoint))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout(self.config.timeout_secs)
                } else {
                    AiError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = match status.as_u16() {
                401 => "invalid API key".to_string(),
                429 => "rate limited".to_string(),
                s if s >= 500 => "upstream server error".to_string(),
                _ => response.text().await.unwrap_or_default(),
            };
            return Err(AiError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| AiError::Request(format!("malformed API response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text.clone())
            .ok_or(AiError::EmptyReply)?;

        debug!(bytes = text.len(), "AI reply received");
        Ok(text)
    }
}

/// Scripted client for tests: replies are consumed in order, the last one
/// repeats.
pub struct FakeAiClient {
    replies: Mutex<Vec<Result<String, AiError>>>,
    calls: Mutex<usize>,
}

impl FakeAiClient {
    pub fn new(replies: Vec<Result<String, AiError>>) -> Self {
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(0),
        }
    }

    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    pub fn always_error(error: AiError) -> Self {
        Self::new(vec![Err(error)])
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl AiClient for FakeAiClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
    ) -> Result<String, AiError> {
        *self.calls.lock().unwrap() += 1;

        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(AiError::EmptyReply);
        }
        if replies.len() == 1 {
            replies[0].clone()
        } else {
            replies.remove(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_client_repeats_last_reply() {
        let client = FakeAiClient::always("hello");
        assert_eq!(client.complete("", &[]).await.unwrap(), "hello");
        assert_eq!(client.complete("", &[]).await.unwrap(), "hello");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fake_client_scripted_sequence() {
        let client = FakeAiClient::new(vec![
            Ok("first".to_string()),
            Err(AiError::Service {
                status: 429,
                message: "rate limited".to_string(),
            }),
        ]);

        assert_eq!(client.complete("", &[]).await.unwrap(), "first");
        let err = client.complete("", &[]).await.unwrap_err();
        assert!(matches!(err, AiError::Service { status: 429, .. }));
    }

    #[test]
    fn test_default_config() {
        let config = AiConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.endpoint.starts_with("https://"));
    }
}

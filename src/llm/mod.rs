pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum LlmError {
    Config(String),
    /// Network-level failure before any response arrived.
    Connection(String),
    /// Non-success HTTP status from the provider.
    Http { status: u16, detail: String },
    /// The provider answered but the payload was unusable.
    Response(String),
    /// A single attempt exceeded its deadline.
    Timeout,
    /// Transient failures exhausted the retry budget.
    Unavailable { attempts: u32, last: String },
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Config(msg) => write!(f, "LLM configuration error: {}", msg),
            LlmError::Connection(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::Http { status, detail } => {
                write!(f, "LLM provider responded with status {}: {}", status, detail)
            }
            LlmError::Response(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::Timeout => write!(f, "LLM call exceeded its deadline"),
            LlmError::Unavailable { attempts, last } => {
                write!(f, "LLM unavailable after {} attempts, last error: {}", attempts, last)
            }
        }
    }
}

impl Error for LlmError {}

impl LlmError {
    /// Transient failures are worth retrying; auth and malformed-request
    /// failures are not.
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Connection(_) => true,
            LlmError::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call-site generation settings. SQL generation and summarization run
/// with different temperatures and token budgets.
#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub max_tokens: usize,
    pub temperature: f32,
}

/// One stateless chat-completion round trip. Providers do no retrying of
/// their own; `LlmClient` owns the retry and deadline policy.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, LlmError>;
}

pub struct LlmClient {
    provider: Box<dyn ChatCompletion>,
    request_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider: Box<dyn ChatCompletion> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            other => {
                return Err(LlmError::Config(format!(
                    "unsupported LLM backend: {}",
                    other
                )))
            }
        };
        Ok(Self::with_provider(provider, config))
    }

    pub fn with_provider(provider: Box<dyn ChatCompletion>, config: &LlmConfig) -> Self {
        Self {
            provider,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Runs one completion with a per-attempt deadline, retrying transient
    /// failures with exponential backoff until the retry budget runs out.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        settings: CallSettings,
    ) -> Result<String, LlmError> {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                debug!(attempt, ?backoff, "retrying LLM call");
                tokio::time::sleep(backoff).await;
            }

            let call = self
                .provider
                .chat(messages, settings.max_tokens, settings.temperature);
            match tokio::time::timeout(self.request_timeout, call).await {
                Err(_) => return Err(LlmError::Timeout),
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(attempt, "transient LLM failure: {}", e);
                    last_error = e.to_string();
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        Err(LlmError::Unavailable {
            attempts: self.max_retries + 1,
            last: last_error,
        })
    }
}

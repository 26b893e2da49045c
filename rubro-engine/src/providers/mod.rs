//! Pluggable LLM providers
//!
//! A provider turns one prompt+payload message into one completion. The
//! dispatcher is provider-agnostic; adding a vendor means implementing
//! [`LlmProvider`] and registering it with the factory.

mod gemini;
mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Provider call errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Response parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether a retry can plausibly succeed
    ///
    /// Network trouble, timeouts, rate limits, server-side errors, and
    /// malformed payloads are transient. Auth failures and client-side
    /// rejections are deterministic.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::RateLimited
            | ProviderError::Parse(_) => true,
            ProviderError::Api(status, _) => *status == 429 || *status >= 500,
            ProviderError::Auth(_) => false,
        }
    }
}

/// One chat message
#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// Completion request parameters
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Completion result
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub tokens_used: u64,
    /// Provider-assigned response id, for tracing
    pub id: String,
}

/// A bound LLM provider instance
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider identifier ("openai", "gemini", ...)
    fn provider_id(&self) -> &'static str;

    /// Execute one completion
    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;

    /// Cheap credential check used at batch start
    async fn validate_api_key(&self) -> Result<(), ProviderError>;
}

/// Resolve a provider identifier to a bound instance
///
/// The factory is the only place that knows concrete provider types; an
/// unknown identifier or missing key is fatal for the batch.
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create(
        provider_id: &str,
        api_key: Option<String>,
    ) -> Result<Arc<dyn LlmProvider>, EngineError> {
        let api_key = api_key.ok_or_else(|| {
            EngineError::Fatal(format!("no API key configured for provider {}", provider_id))
        })?;

        match provider_id {
            "openai" => Ok(Arc::new(OpenAiProvider::new(api_key).map_err(|e| {
                EngineError::Fatal(format!("openai client init failed: {}", e))
            })?)),
            "gemini" => Ok(Arc::new(GeminiProvider::new(api_key).map_err(|e| {
                EngineError::Fatal(format!("gemini client init failed: {}", e))
            })?)),
            other => Err(EngineError::Fatal(format!(
                "unresolved provider: {}",
                other
            ))),
        }
    }
}

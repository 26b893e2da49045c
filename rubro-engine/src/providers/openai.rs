//! OpenAI chat completions client

use super::{CompletionRequest, CompletionResponse, LlmProvider, Message, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const USER_AGENT: &str = concat!("rubro/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    id: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u64,
}

/// OpenAI provider bound to one API key
pub struct OpenAiProvider {
    http_client: reqwest::Client,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_key,
        })
    }

    fn triage_status(status: reqwest::StatusCode, body: String) -> ProviderError {
        match status.as_u16() {
            401 | 403 => ProviderError::Auth(body),
            429 => ProviderError::RateLimited,
            code => ProviderError::Api(code, body),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m: &Message| ChatMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", OPENAI_BASE_URL))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::triage_status(status, text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ProviderError::Parse("response carried no content".to_string()))?;

        Ok(CompletionResponse {
            content,
            tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
            id: parsed.id,
        })
    }

    async fn validate_api_key(&self) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .get(format!("{}/models", OPENAI_BASE_URL))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::triage_status(status, text))
        }
    }
}

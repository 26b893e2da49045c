//! Google Gemini generateContent client

use super::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const USER_AGENT: &str = concat!("rubro/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: u64,
}

/// Gemini provider bound to one API key
pub struct GeminiProvider {
    http_client: reqwest::Client,
    api_key: String,
}

impl GeminiProvider {
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
impl LlmProvider for GeminiProvider {
    fn provider_id(&self) -> &'static str {
        "gemini"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        // Gemini takes a single text blob; concatenate the messages in order
        let text = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: &text }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            GEMINI_BASE_URL, request.model, self.api_key
        );

        let response = self
            .http_client
            .post(&url)
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

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .and_then(|p| p.text.clone())
            .ok_or_else(|| ProviderError::Parse("response carried no text part".to_string()))?;

        Ok(CompletionResponse {
            content,
            tokens_used: parsed
                .usage_metadata
                .map(|u| u.total_token_count)
                .unwrap_or(0),
            id: String::new(), // Gemini responses carry no id
        })
    }

    async fn validate_api_key(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models?key={}", GEMINI_BASE_URL, self.api_key);
        let response = self
            .http_client
            .get(&url)
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

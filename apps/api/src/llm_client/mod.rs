//! LLM Client: the single point of entry for all text generation calls.
//!
//! ARCHITECTURAL RULE: No other module may call a model provider directly.
//! The pipeline depends on the `TextGenerator` trait; `LlmClient` is the
//! production implementation, routing each model key through the catalog.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod models;
pub mod parse;
pub mod prompts;

use models::{ModelSpec, Provider};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CEREBRAS_API_URL: &str = "https://api.cerebras.ai/v1/chat/completions";
const MAX_RETRIES: u32 = 3;
const HTTP_TIMEOUT_SECS: u64 = 55;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("Unknown model key '{0}'")]
    UnknownModel(String),

    #[error("No API key configured for {0:?}")]
    MissingApiKey(Provider),
}

impl LlmError {
    /// True when the upstream answered 429.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::Api { status: 429, .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Text produced by one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct GenerationOptions<'a> {
    pub system: &'a str,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

/// Text generation collaborator used by the tailoring pipeline.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        model_key: &str,
        options: &GenerationOptions<'_>,
    ) -> Result<Generation, LlmError>;
}

// ── Anthropic wire types ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicResponse {
    fn into_generation(self) -> Result<Generation, LlmError> {
        let text = self
            .content
            .into_iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyContent)?;
        Ok(Generation {
            text,
            usage: Some(Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            }),
        })
    }
}

// ── OpenAI-compatible (Cerebras) wire types ─────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl ChatCompletionResponse {
    fn into_generation(self) -> Result<Generation, LlmError> {
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyContent)?;
        Ok(Generation {
            text,
            usage: self.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: ProviderErrorBody,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    message: String,
}

/// Wraps the Anthropic Messages API and the Cerebras chat completions API
/// with retry logic.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    anthropic_api_key: String,
    cerebras_api_key: Option<String>,
}

impl LlmClient {
    pub fn new(
        anthropic_api_key: String,
        cerebras_api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            anthropic_api_key,
            cerebras_api_key,
        })
    }

    async fn call_anthropic(
        &self,
        spec: &ModelSpec,
        prompt: &str,
        options: &GenerationOptions<'_>,
    ) -> Result<Generation, LlmError> {
        let body = AnthropicRequest {
            model: spec.upstream_id,
            max_tokens: options.max_tokens.unwrap_or(spec.max_output_tokens),
            temperature: options.temperature,
            system: options.system,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .send_with_retry(|| {
                self.client
                    .post(ANTHROPIC_API_URL)
                    .header("x-api-key", &self.anthropic_api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("content-type", "application/json")
                    .json(&body)
            })
            .await?;

        let parsed: AnthropicResponse = response.json().await?;
        parsed.into_generation()
    }

    async fn call_cerebras(
        &self,
        spec: &ModelSpec,
        prompt: &str,
        options: &GenerationOptions<'_>,
    ) -> Result<Generation, LlmError> {
        let api_key = self
            .cerebras_api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey(Provider::Cerebras))?;

        let body = ChatCompletionRequest {
            model: spec.upstream_id,
            max_tokens: options.max_tokens.unwrap_or(spec.max_output_tokens),
            temperature: options.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: options.system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .send_with_retry(|| {
                self.client
                    .post(CEREBRAS_API_URL)
                    .bearer_auth(api_key)
                    .json(&body)
            })
            .await?;

        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining-requests-day")
            .and_then(|v| v.to_str().ok())
        {
            debug!("Cerebras daily requests remaining: {remaining}");
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        parsed.into_generation()
    }

    /// Sends the request built by `build`, retrying 429 and 5xx with
    /// exponential backoff (1s, 2s).
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, LlmError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "LLM call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("LLM API returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                    retry_after,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ProviderError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message,
                    retry_after,
                });
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or(LlmError::EmptyContent))
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        model_key: &str,
        options: &GenerationOptions<'_>,
    ) -> Result<Generation, LlmError> {
        let spec =
            models::lookup(model_key).ok_or_else(|| LlmError::UnknownModel(model_key.to_string()))?;

        let generation = match spec.provider {
            Provider::Anthropic => self.call_anthropic(spec, prompt, options).await?,
            Provider::Cerebras => self.call_cerebras(spec, prompt, options).await?,
        };

        if let Some(usage) = generation.usage {
            debug!(
                "LLM call succeeded: model={}, input_tokens={}, output_tokens={}",
                spec.upstream_id, usage.input_tokens, usage.output_tokens
            );
        }

        Ok(generation)
    }
}

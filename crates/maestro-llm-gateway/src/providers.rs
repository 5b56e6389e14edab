//! LLM provider implementations.
//!
//! Providers translate the gateway's uniform request/response types into a
//! concrete vendor API over HTTP. API keys are held behind `secrecy` and
//! never logged. Status-code mapping: 429 is `rate_limited`, 408/5xx are
//! `call_failed` (transient), everything else non-success is `call_failed`
//! with the body attached.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::{GatewayError, LlmRequest, LlmResponse, TokenUsage};

/// Trait implemented by every language-model provider.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a text generation request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, GatewayError>;

    /// Provider name for logging and metrics.
    fn provider_name(&self) -> &'static str;

    /// Default model identifier in use.
    fn model_name(&self) -> &str;
}

fn map_status(status: StatusCode, body: &str) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited
    } else {
        GatewayError::CallFailed(format!("{status}: {body}"))
    }
}

fn map_transport(err: reqwest::Error) -> GatewayError {
    GatewayError::CallFailed(err.to_string())
}

//─────────────────────────────
//  Anthropic
//─────────────────────────────

/// Anthropic messages-API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: Secret<String>,
    model: String,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
    /// Create a provider. The key format is validated up front so
    /// misconfiguration fails at startup rather than on first use.
    pub fn new(
        api_key: Secret<String>,
        model: String,
        base_url: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        if !api_key.expose_secret().starts_with("sk-ant-") {
            anyhow::bail!("invalid Anthropic API key format");
        }

        let base_url = Url::parse(
            &base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        )
        .context("invalid Anthropic base URL")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("maestro-llm-gateway/0.1")
            .build()
            .context("failed to create HTTP client")?;

        debug!(model = %model, "initialized Anthropic provider");
        Ok(Self {
            client,
            api_key,
            model,
            base_url,
        })
    }

    fn headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.expose_secret())
                .map_err(|_| GatewayError::CallFailed("invalid api key header".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, GatewayError> {
        let start = std::time::Instant::now();
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let body = AnthropicRequest {
            model: model.clone(),
            max_tokens: request.max_tokens.unwrap_or(4096),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.user.clone(),
            }],
            system: request.system.clone(),
            temperature: request.temperature,
        };

        let url = self
            .base_url
            .join("/v1/messages")
            .map_err(|e| GatewayError::CallFailed(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let parsed: AnthropicResponse = response.json().await.map_err(map_transport)?;
        let content = parsed
            .content
            .into_iter()
            .find(|c| c.content_type == "text")
            .map(|c| c.text)
            .ok_or_else(|| GatewayError::CallFailed("no text content in response".into()))?;

        Ok(LlmResponse {
            content,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
            latency: start.elapsed(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

//─────────────────────────────
//  OpenAI
//─────────────────────────────

/// OpenAI chat-completions provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: Secret<String>,
    model: String,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl OpenAiProvider {
    /// Create a provider.
    pub fn new(
        api_key: Secret<String>,
        model: String,
        base_url: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let base_url =
            Url::parse(&base_url.unwrap_or_else(|| "https://api.openai.com".to_string()))
                .context("invalid OpenAI base URL")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("maestro-llm-gateway/0.1")
            .build()
            .context("failed to create HTTP client")?;

        debug!(model = %model, "initialized OpenAI provider");
        Ok(Self {
            client,
            api_key,
            model,
            base_url,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, GatewayError> {
        let start = std::time::Instant::now();
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user.clone(),
        });

        let body = OpenAiRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = self
            .base_url
            .join("/v1/chat/completions")
            .map_err(|e| GatewayError::CallFailed(e.to_string()))?;

        let auth = format!("Bearer {}", self.api_key.expose_secret());
        let response = self
            .client
            .post(url)
            .header(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| GatewayError::CallFailed("invalid api key header".into()))?,
            )
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let parsed: OpenAiResponse = response.json().await.map_err(map_transport)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::CallFailed("no choices in response".into()))?;

        Ok(LlmResponse {
            content,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
            latency: start.elapsed(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

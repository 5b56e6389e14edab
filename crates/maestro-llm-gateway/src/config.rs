//! Gateway configuration.
//!
//! Configuration is loaded from environment variables; the API key is held
//! behind [`secrecy::Secret`] so it never appears in debug output or logs.

use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::Secret;
use serde::{Deserialize, Serialize};

use crate::providers::{AnthropicProvider, LlmProvider, OpenAiProvider};
use crate::retry::RetryPolicy;
use crate::DEFAULT_RATE_LIMIT;

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Anthropic messages API.
    Anthropic,
    /// OpenAI chat-completions API.
    OpenAi,
}

/// Gateway configuration.
pub struct Config {
    /// Provider family to construct.
    pub provider: ProviderKind,
    /// Default model identifier, opaque to the engine.
    pub model: String,
    /// Provider API key.
    pub api_key: Secret<String>,
    /// Base URL override for self-hosted or proxied deployments.
    pub base_url: Option<String>,
    /// Per-attempt call timeout in seconds.
    pub timeout_secs: u64,
    /// Per-agent rate limit, requests per minute.
    pub rate_limit_per_minute: u32,
    /// Maximum in-flight provider calls before `busy`.
    pub max_concurrency: usize,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// `MAESTRO_LLM_PROVIDER` selects the provider (`anthropic` default,
    /// `openai`); the matching `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` must be
    /// set. `MAESTRO_LLM_MODEL`, `MAESTRO_LLM_TIMEOUT_SECS`,
    /// `MAESTRO_LLM_RATE_LIMIT`, and `MAESTRO_LLM_CONCURRENCY` override the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let provider = match std::env::var("MAESTRO_LLM_PROVIDER")
            .unwrap_or_else(|_| "anthropic".to_string())
            .to_lowercase()
            .as_str()
        {
            "anthropic" => ProviderKind::Anthropic,
            "openai" => ProviderKind::OpenAi,
            other => anyhow::bail!("unsupported LLM provider: {other}"),
        };

        let (key_var, default_model) = match provider {
            ProviderKind::Anthropic => ("ANTHROPIC_API_KEY", "claude-3-5-sonnet-20241022"),
            ProviderKind::OpenAi => ("OPENAI_API_KEY", "gpt-4o"),
        };

        let api_key = std::env::var(key_var)
            .map(Secret::new)
            .with_context(|| format!("{key_var} is not set"))?;

        let model =
            std::env::var("MAESTRO_LLM_MODEL").unwrap_or_else(|_| default_model.to_string());

        Ok(Self {
            provider,
            model,
            api_key,
            base_url: std::env::var("MAESTRO_LLM_BASE_URL").ok(),
            timeout_secs: env_u64("MAESTRO_LLM_TIMEOUT_SECS", 60),
            rate_limit_per_minute: env_u64("MAESTRO_LLM_RATE_LIMIT", u64::from(DEFAULT_RATE_LIMIT))
                as u32,
            max_concurrency: env_u64("MAESTRO_LLM_CONCURRENCY", 8) as usize,
            retry: RetryPolicy::default(),
        })
    }

    /// A permissive configuration for tests with stub providers.
    pub fn for_tests() -> Self {
        Self {
            provider: ProviderKind::Anthropic,
            model: "stub".to_string(),
            api_key: Secret::new("sk-ant-test".to_string()),
            base_url: None,
            timeout_secs: 5,
            rate_limit_per_minute: 10_000,
            max_concurrency: 16,
            retry: RetryPolicy::default(),
        }
    }

    /// Construct the configured provider.
    pub fn create_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        let provider: Arc<dyn LlmProvider> = match self.provider {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                self.api_key.clone(),
                self.model.clone(),
                self.base_url.clone(),
                self.timeout_secs,
            )?),
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                self.api_key.clone(),
                self.model.clone(),
                self.base_url.clone(),
                self.timeout_secs,
            )?),
        };
        Ok(provider)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

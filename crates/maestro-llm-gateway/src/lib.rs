#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-llm-gateway** – Uniform LLM provider gateway for Maestro.
//!
//! This crate gives the engine a single request/response interface to the
//! language-model oracle: pluggable providers, structured-output coercion,
//! bounded retries with exponential backoff, per-agent rate limiting, and a
//! concurrency cap that refuses new work with `busy` instead of queueing
//! unboundedly. Model identifiers are opaque to the engine.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use maestro_llm_gateway::{Config, LlmGateway, LlmRequest};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let gateway = LlmGateway::new(config)?;
//!
//! let request = LlmRequest::new("Summarize the current onboarding state")?;
//! let response = gateway.complete(request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use maestro_types::{AgentId, EngineError, RequestId, TaskId};

pub mod config;
pub mod providers;
pub mod retry;

pub use config::{Config, ProviderKind};
pub use providers::{AnthropicProvider, LlmProvider, OpenAiProvider};
pub use retry::RetryPolicy;

/// Maximum allowed prompt length in characters.
pub const MAX_PROMPT_LENGTH: usize = 131_072; // 128KB

/// Maximum allowed response length in characters.
pub const MAX_RESPONSE_LENGTH: usize = 1_048_576; // 1MB

/// Default per-agent rate limit, requests per minute.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The provider call failed transiently (network, 5xx, timeout).
    #[error("provider call failed: {0}")]
    CallFailed(String),
    /// The model output could not be coerced into the expected JSON shape.
    #[error("could not parse model output: {0}")]
    ParseFailed(String),
    /// The provider (or the local limiter) throttled the request.
    #[error("rate limited")]
    RateLimited,
    /// The local concurrency cap refused new work.
    #[error("busy: gateway concurrency cap exceeded")]
    Busy,
    /// Cancellation was signalled while the call was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether the retry policy may absorb this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CallFailed(_) | Self::RateLimited | Self::Busy)
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CallFailed(msg) => EngineError::CallFailed(msg),
            GatewayError::ParseFailed(msg) => EngineError::ParseFailed(msg),
            GatewayError::RateLimited => EngineError::RateLimited,
            GatewayError::Busy => EngineError::Busy,
            GatewayError::Cancelled => EngineError::Cancelled,
        }
    }
}

//─────────────────────────────
//  Request / response types
//─────────────────────────────

/// Auditing metadata attached to every gateway request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Task the request serves, when known.
    pub task_id: Option<TaskId>,
    /// Agent on whose behalf the request runs, when known.
    pub agent_id: Option<AgentId>,
    /// Idempotency/trace token.
    pub request_id: RequestId,
    /// Short free-form purpose tag (e.g. `planning`, `recovery_advice`).
    pub purpose: String,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            task_id: None,
            agent_id: None,
            request_id: RequestId::random(),
            purpose: "general".to_string(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Optional system prompt.
    pub system: Option<String>,
    /// User prompt.
    pub user: String,
    /// Model override; `None` uses the configured default.
    pub model: Option<String>,
    /// Sampling temperature in `[0, 1]`.
    pub temperature: Option<f32>,
    /// Response token cap.
    pub max_tokens: Option<u32>,
    /// Auditing metadata.
    pub metadata: RequestMetadata,
}

impl LlmRequest {
    /// Create a request with prompt validation.
    pub fn new(user: impl Into<String>) -> Result<Self, GatewayError> {
        let user = user.into();
        if user.trim().is_empty() {
            return Err(GatewayError::CallFailed("prompt cannot be empty".into()));
        }
        if user.len() > MAX_PROMPT_LENGTH {
            return Err(GatewayError::CallFailed(format!(
                "prompt too long: {} > {}",
                user.len(),
                MAX_PROMPT_LENGTH
            )));
        }
        Ok(Self {
            system: None,
            user,
            model: None,
            temperature: None,
            max_tokens: None,
            metadata: RequestMetadata::default(),
        })
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    /// Cap the response token count.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Attach auditing metadata.
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

/// A completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Generated text.
    pub content: String,
    /// Model that produced the response.
    pub model: String,
    /// Token usage.
    pub usage: TokenUsage,
    /// Round-trip latency.
    pub latency: Duration,
}

/// Aggregate gateway metrics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    /// Total requests processed.
    pub total_requests: u64,
    /// Total successful responses.
    pub successful_responses: u64,
    /// Total failed requests.
    pub failed_requests: u64,
    /// Total tokens consumed.
    pub total_tokens: u64,
    /// Rolling average response time in milliseconds.
    pub avg_response_time_ms: f64,
}

//─────────────────────────────
//  Gateway
//─────────────────────────────

type KeyedLimiter = RateLimiter<
    String,
    governor::state::keyed::DashMapStateStore<String>,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

/// The uniform gateway in front of a language-model provider.
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    rate_limiter: Arc<KeyedLimiter>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    call_timeout: Duration,
    metrics: Arc<RwLock<GatewayMetrics>>,
}

impl LlmGateway {
    /// Build a gateway from configuration, constructing the provider.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let provider = config.create_provider()?;
        Ok(Self::with_provider(provider, &config))
    }

    /// Build a gateway around an existing provider (tests inject stubs here).
    pub fn with_provider(provider: Arc<dyn LlmProvider>, config: &Config) -> Self {
        info!(provider = provider.provider_name(), "initializing LLM gateway");

        let quota = Quota::per_minute(
            std::num::NonZeroU32::new(config.rate_limit_per_minute.max(1))
                .expect("max(1) is non-zero"),
        );

        Self {
            provider,
            rate_limiter: Arc::new(RateLimiter::keyed(quota)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: config.retry.clone(),
            call_timeout: Duration::from_secs(config.timeout_secs),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
        }
    }

    /// Complete a text request.
    ///
    /// Applies the concurrency cap (`busy` when full), per-agent rate
    /// limiting, the bounded retry policy for transient provider failures,
    /// and a hard timeout per attempt (expiry is `call_failed`, retryable).
    pub async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, GatewayError> {
        let _permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| GatewayError::Busy)?;

        let rate_key = request
            .metadata
            .agent_id
            .as_ref()
            .map(|a| a.0.clone())
            .unwrap_or_else(|| "orchestrator".to_string());
        if self.rate_limiter.check_key(&rate_key).is_err() {
            warn!(agent = %rate_key, "local rate limit exceeded");
            return Err(GatewayError::RateLimited);
        }

        let start = std::time::Instant::now();
        let result = self
            .retry
            .execute(|| async {
                match tokio::time::timeout(self.call_timeout, self.provider.complete(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::CallFailed(format!(
                        "provider call exceeded {:?}",
                        self.call_timeout
                    ))),
                }
            })
            .await;

        match result {
            Ok(response) => {
                if response.content.len() > MAX_RESPONSE_LENGTH {
                    self.record_failure().await;
                    return Err(GatewayError::CallFailed(format!(
                        "response too long: {} > {}",
                        response.content.len(),
                        MAX_RESPONSE_LENGTH
                    )));
                }
                self.record_success(start.elapsed(), &response).await;
                debug!(
                    purpose = %request.metadata.purpose,
                    latency_ms = start.elapsed().as_millis() as u64,
                    tokens = response.usage.total_tokens,
                    "llm call completed"
                );
                Ok(response)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    /// Complete a request and coerce the output into a JSON value.
    ///
    /// Prompts for JSON, parses the raw response, falls back to extracting
    /// the first balanced JSON object from the text, and makes exactly one
    /// reinforcement retry before reporting `parse_failed`.
    pub async fn complete_structured(
        &self,
        request: LlmRequest,
    ) -> Result<(Value, LlmResponse), GatewayError> {
        let json_instruction = "Respond with a single JSON object and nothing else. \
                                No markdown fences, no commentary.";
        let primed = LlmRequest {
            system: Some(match &request.system {
                Some(system) => format!("{system}\n\n{json_instruction}"),
                None => json_instruction.to_string(),
            }),
            ..request.clone()
        };

        let response = self.complete(primed.clone()).await?;
        if let Some(value) = coerce_json(&response.content) {
            return Ok((value, response));
        }

        warn!(
            purpose = %request.metadata.purpose,
            "model output was not parseable JSON, retrying with reinforcement"
        );
        let reinforced = LlmRequest {
            user: format!(
                "{}\n\nYour previous reply could not be parsed as JSON. \
                 Reply again with ONLY the JSON object.",
                primed.user
            ),
            ..primed
        };
        let response = self.complete(reinforced).await?;
        match coerce_json(&response.content) {
            Some(value) => Ok((value, response)),
            None => Err(GatewayError::ParseFailed(truncate(&response.content, 256))),
        }
    }

    /// Current aggregate metrics.
    pub async fn metrics(&self) -> GatewayMetrics {
        self.metrics.read().await.clone()
    }

    async fn record_success(&self, latency: Duration, response: &LlmResponse) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.successful_responses += 1;
        metrics.total_tokens += u64::from(response.usage.total_tokens);

        let n = metrics.successful_responses as f64;
        let latency_ms = latency.as_millis() as f64;
        metrics.avg_response_time_ms = (metrics.avg_response_time_ms * (n - 1.0) + latency_ms) / n;
    }

    async fn record_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
    }
}

//─────────────────────────────
//  JSON coercion helpers
//─────────────────────────────

/// Parse `content` as JSON, falling back to the first balanced object
/// embedded in the text.
pub fn coerce_json(content: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }
    extract_json_object(content).and_then(|raw| serde_json::from_str(raw).ok())
}

/// Find the first balanced `{ ... }` region in `content`, respecting string
/// literals and escapes.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        replies: Vec<Result<String, GatewayError>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, GatewayError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let reply = self
                .replies
                .get(index.min(self.replies.len() - 1))
                .expect("scripted provider has at least one reply");
            match reply {
                Ok(content) => Ok(LlmResponse {
                    content: content.clone(),
                    model: "scripted".into(),
                    usage: TokenUsage::default(),
                    latency: Duration::from_millis(1),
                }),
                Err(GatewayError::CallFailed(msg)) => Err(GatewayError::CallFailed(msg.clone())),
                Err(GatewayError::RateLimited) => Err(GatewayError::RateLimited),
                Err(_) => Err(GatewayError::CallFailed("scripted".into())),
            }
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn gateway(replies: Vec<Result<String, GatewayError>>) -> LlmGateway {
        let mut config = Config::for_tests();
        config.retry = RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            rate_limit_multiplier: 1,
            jitter: 0.0,
        };
        LlmGateway::with_provider(
            Arc::new(ScriptedProvider {
                replies,
                calls: AtomicU32::new(0),
            }),
            &config,
        )
    }

    #[test]
    fn test_extract_json_object_balanced() {
        let content = r#"Here is the plan: {"a": {"b": "}"}, "c": 1} trailing"#;
        assert_eq!(
            extract_json_object(content),
            Some(r#"{"a": {"b": "}"}, "c": 1}"#)
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{unbalanced"), None);
    }

    #[test]
    fn test_coerce_json_direct_and_embedded() {
        assert!(coerce_json(r#"{"x": 1}"#).is_some());
        assert!(coerce_json("```json\n{\"x\": 1}\n```").is_some());
        assert!(coerce_json("definitely prose").is_none());
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let gateway = gateway(vec![
            Err(GatewayError::CallFailed("503".into())),
            Err(GatewayError::CallFailed("503".into())),
            Ok("all good".into()),
        ]);
        let response = gateway
            .complete(LlmRequest::new("hello").unwrap())
            .await
            .unwrap();
        assert_eq!(response.content, "all good");

        let metrics = gateway.metrics().await;
        assert_eq!(metrics.successful_responses, 1);
    }

    #[tokio::test]
    async fn test_structured_reinforcement_retry() {
        let gateway = gateway(vec![
            Ok("I think the answer is yes!".into()),
            Ok(r#"{"answer": "yes"}"#.into()),
        ]);
        let (value, _) = gateway
            .complete_structured(LlmRequest::new("answer me").unwrap())
            .await
            .unwrap();
        assert_eq!(value["answer"], "yes");
    }

    #[tokio::test]
    async fn test_structured_gives_up_with_parse_failed() {
        let gateway = gateway(vec![Ok("prose".into()), Ok("more prose".into())]);
        let err = gateway
            .complete_structured(LlmRequest::new("answer me").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ParseFailed(_)));
    }

    #[tokio::test]
    async fn test_busy_when_concurrency_cap_full() {
        let mut config = Config::for_tests();
        config.max_concurrency = 1;
        let gateway = LlmGateway::with_provider(
            Arc::new(ScriptedProvider {
                replies: vec![Ok("ok".into())],
                calls: AtomicU32::new(0),
            }),
            &config,
        );

        let _held = gateway.semaphore.clone().try_acquire_owned().unwrap();
        let err = gateway
            .complete(LlmRequest::new("hello").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Busy));
    }

    #[test]
    fn test_request_validation() {
        assert!(LlmRequest::new("").is_err());
        assert!(LlmRequest::new("  ").is_err());
        assert!(LlmRequest::new("fine").is_ok());
    }
}

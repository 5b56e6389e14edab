//! Named tool dispatch with idempotency.
//!
//! Agents invoke tools through this gateway, which forwards the subtask's
//! `request_id` to every call and memoizes outcomes per `(tool, request_id)`.
//! A retried subtask therefore replays the recorded outcome instead of
//! re-executing the side effect, which is what makes at-least-once delivery
//! safe for side-effecting tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use maestro_types::{EngineError, RequestId};

/// A named tool an agent may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, referenced from agent definitions.
    fn name(&self) -> &str;

    /// Invoke the tool. Implementations receive the forwarded `request_id`
    /// and must produce the same external side effect at most once per id.
    async fn invoke(&self, args: Value, request_id: &RequestId) -> Result<Value, EngineError>;
}

/// Tool dispatch gateway with per-request-id memoization.
pub struct ToolGateway {
    tools: HashMap<String, Arc<dyn Tool>>,
    outcomes: DashMap<(String, RequestId), Value>,
}

impl Default for ToolGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolGateway {
    /// An empty gateway with no tools registered.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            outcomes: DashMap::new(),
        }
    }

    /// Register a tool. Later registrations under the same name replace
    /// earlier ones.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "replacing previously registered tool");
        }
    }

    /// Registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Invoke `name`, replaying the recorded outcome for a repeated
    /// `request_id`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        request_id: &RequestId,
    ) -> Result<Value, EngineError> {
        let key = (name.to_string(), request_id.clone());
        if let Some(prior) = self.outcomes.get(&key) {
            debug!(tool = name, request = %request_id, "replaying recorded tool outcome");
            return Ok(prior.clone());
        }

        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("tool {name}")))?;

        let outcome = tool.invoke(args, request_id).await?;
        self.outcomes.insert(key, outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTool {
        invocations: AtomicU32,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "registry_lookup"
        }

        async fn invoke(&self, args: Value, _request_id: &RequestId) -> Result<Value, EngineError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"echo": args, "invocation": n}))
        }
    }

    #[tokio::test]
    async fn test_repeated_request_id_replays_outcome() {
        let tool = Arc::new(CountingTool {
            invocations: AtomicU32::new(0),
        });
        let mut gateway = ToolGateway::new();
        gateway.register(tool.clone());

        let request_id = RequestId("req-1".into());
        let first = gateway
            .invoke("registry_lookup", json!({"q": "acme"}), &request_id)
            .await
            .unwrap();
        let second = gateway
            .invoke("registry_lookup", json!({"q": "acme"}), &request_id)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);

        // A different request id executes the side effect again
        let third = gateway
            .invoke("registry_lookup", json!({"q": "acme"}), &RequestId("req-2".into()))
            .await
            .unwrap();
        assert_eq!(third["invocation"], 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_not_found() {
        let gateway = ToolGateway::new();
        let err = gateway
            .invoke("missing", json!({}), &RequestId("req-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}

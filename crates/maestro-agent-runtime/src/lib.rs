#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-agent-runtime** – Specialized agent execution runtime for
//! Maestro.
//!
//! The runtime sits between the dispatcher and agent domain logic. It loads
//! an agent definition, executes one subtask request against a read-only
//! task snapshot, and returns the response envelope, enforcing the
//! contract every agent must obey:
//!
//! - unrecognized instructions yield `unknown_instruction` errors and alter
//!   no state beyond the audit entry
//! - `needs_input` responses must carry at least one UI request; the runtime
//!   appends the `ui_request_created` events itself and the dispatcher parks
//!   the subtask on the rendezvous
//! - confidence is clamped to `[0, 1]`, missing reasoning is replaced by a
//!   fixed placeholder
//! - responses are validated against the definition's output schema and
//!   rejected as `contract_violation` when non-conforming
//! - every invocation appends at least one context entry, including
//!   explicit no-op decisions
//!
//! Domain logic lives behind [`AgentHandler`]; the built-in
//! [`LlmAgentHandler`] drives it through the LLM gateway.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use maestro_projection::TaskSnapshot;
use maestro_store_core::TaskWriter;
use maestro_types::{
    ops, Actor, AgentDefinition, AgentErrorKind, AgentId, AgentRequest, AgentResponse,
    AgentStatus, EngineError, NewEntry, RequestId, Trigger, UiRequest,
};

pub mod contract;
pub mod handler;
pub mod tools;

pub use contract::validate_against_schema;
pub use handler::{AgentHandler, LlmAgentHandler};
pub use tools::{Tool, ToolGateway};

/// Placeholder recorded when an agent omits its `reasoning`.
pub const REASONING_PLACEHOLDER: &str = "Agent provided no reasoning.";

/// Default cap on concurrent invocations of one agent.
pub const DEFAULT_AGENT_CONCURRENCY: usize = 4;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum concurrent invocations per agent before `busy`.
    pub max_concurrency_per_agent: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_agent: DEFAULT_AGENT_CONCURRENCY,
        }
    }
}

/// The specialized-agent execution runtime.
pub struct AgentRuntime {
    handler: Arc<dyn AgentHandler>,
    tools: Arc<ToolGateway>,
    config: RuntimeConfig,
    limits: DashMap<AgentId, Arc<Semaphore>>,
    completed: DashMap<RequestId, AgentResponse>,
}

impl AgentRuntime {
    /// Build a runtime around a handler and tool gateway.
    pub fn new(handler: Arc<dyn AgentHandler>, tools: Arc<ToolGateway>) -> Self {
        Self::with_config(handler, tools, RuntimeConfig::default())
    }

    /// Build a runtime with explicit configuration.
    pub fn with_config(
        handler: Arc<dyn AgentHandler>,
        tools: Arc<ToolGateway>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            handler,
            tools,
            config,
            limits: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    /// Execute one subtask request against `definition`.
    ///
    /// Returns the normalized response envelope. Transport-level failures
    /// (gateway, store) surface as `Err` for the dispatcher's retry
    /// machinery; contract failures surface as `Ok` envelopes with
    /// `status = error` so the failure policy can classify them.
    pub async fn execute(
        &self,
        definition: &AgentDefinition,
        request: AgentRequest,
        snapshot: &TaskSnapshot,
        writer: &TaskWriter,
    ) -> Result<AgentResponse, EngineError> {
        // Idempotent replay: a completed request id returns its recorded
        // envelope without re-executing or re-appending anything
        if let Some(prior) = self.completed.get(&request.request_id) {
            debug!(
                agent = %definition.agent_id,
                request = %request.request_id,
                "replaying recorded response for repeated request id"
            );
            return Ok(prior.clone());
        }

        let semaphore = self
            .limits
            .entry(definition.agent_id.clone())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.max_concurrency_per_agent))
            })
            .clone();
        let _permit = semaphore.try_acquire_owned().map_err(|_| EngineError::Busy)?;

        // Instruction membership is checked before any domain logic runs
        if let Some(supported) = definition.supported_instructions() {
            if !supported.contains(&request.instruction) {
                let response = AgentResponse::error(
                    AgentErrorKind::UnknownInstruction,
                    format!(
                        "agent {} does not support instruction '{}'",
                        definition.agent_id, request.instruction
                    ),
                );
                self.append_decision(definition, &request, &response, writer)
                    .await?;
                return Ok(response);
            }
        }

        info!(
            agent = %definition.agent_id,
            request = %request.request_id,
            instruction = %request.instruction,
            "executing subtask"
        );

        let raw = self
            .handler
            .handle(definition, &request, snapshot, &self.tools)
            .await?;
        let response = self.normalize(definition, raw);

        match response.status {
            AgentStatus::NeedsInput => {
                self.open_ui_requests(definition, &request, &response, writer)
                    .await?;
            }
            AgentStatus::Completed => {
                if observable_data(&response.data).is_none() {
                    // Nothing observable happened; the no-op decision is
                    // still auditable
                    self.append_decision(definition, &request, &response, writer)
                        .await?;
                }
                self.completed
                    .insert(request.request_id.clone(), response.clone());
            }
            AgentStatus::Error | AgentStatus::Delegated => {
                self.append_decision(definition, &request, &response, writer)
                    .await?;
            }
        }

        Ok(response)
    }

    /// Normalize an envelope per the agent contract.
    fn normalize(&self, definition: &AgentDefinition, mut response: AgentResponse) -> AgentResponse {
        if !(0.0..=1.0).contains(&response.confidence) {
            warn!(
                agent = %definition.agent_id,
                confidence = response.confidence,
                "clamping out-of-range confidence"
            );
            response.confidence = response.confidence.clamp(0.0, 1.0);
        }
        if response
            .reasoning
            .as_deref()
            .map_or(true, |r| r.trim().is_empty())
        {
            response.reasoning = Some(REASONING_PLACEHOLDER.to_string());
        }

        if response.status == AgentStatus::NeedsInput && response.ui_requests.is_empty() {
            return AgentResponse::error(
                AgentErrorKind::ContractViolation,
                format!(
                    "agent {} returned needs_input without any ui_requests",
                    definition.agent_id
                ),
            );
        }

        if response.status == AgentStatus::Completed {
            if let Err(violation) =
                validate_against_schema(&definition.output_schema, &response.data)
            {
                return AgentResponse::error(
                    AgentErrorKind::ContractViolation,
                    format!(
                        "agent {} response violates output schema: {}",
                        definition.agent_id, violation
                    ),
                );
            }
        }

        response
    }

    /// Append one `ui_request_created` entry per draft, anchored to a
    /// preceding audit entry that records the needs-input decision.
    async fn open_ui_requests(
        &self,
        definition: &AgentDefinition,
        request: &AgentRequest,
        response: &AgentResponse,
        writer: &TaskWriter,
    ) -> Result<(), EngineError> {
        let audit = self
            .append_decision(definition, request, response, writer)
            .await?;

        for draft in &response.ui_requests {
            let ui_request = UiRequest::from_draft(
                draft.clone(),
                Utc::now(),
                audit.entry_id,
                definition.agent_id.clone(),
            );
            let entry = NewEntry::new(
                Actor::agent(&definition.agent_id, definition.version.clone()),
                ops::UI_REQUEST_CREATED,
                json!({ "request": ui_request }),
                Trigger::agent("agent-runtime"),
            )?
            .with_reasoning(
                response
                    .reasoning
                    .clone()
                    .unwrap_or_else(|| REASONING_PLACEHOLDER.to_string()),
            );
            writer.append(entry).await.map_err(EngineError::from)?;
        }
        Ok(())
    }

    /// Append the audit entry every invocation owes the log.
    async fn append_decision(
        &self,
        definition: &AgentDefinition,
        request: &AgentRequest,
        response: &AgentResponse,
        writer: &TaskWriter,
    ) -> Result<maestro_types::ContextEntry, EngineError> {
        let entry = NewEntry::new(
            Actor::agent(&definition.agent_id, definition.version.clone()),
            ops::AGENT_DECISION,
            json!({
                "request_id": request.request_id,
                "instruction": request.instruction,
                "status": response.status,
                "confidence": response.confidence,
                "error": response.error,
            }),
            Trigger::agent("agent-runtime"),
        )?
        .with_reasoning(
            response
                .reasoning
                .clone()
                .unwrap_or_else(|| REASONING_PLACEHOLDER.to_string()),
        );
        writer.append(entry).await.map_err(EngineError::from)
    }
}

/// Non-empty observable result data, if any.
fn observable_data(data: &Value) -> Option<&Value> {
    match data {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_store_memory::MemoryStore;
    use maestro_store_core::TaskStore;
    use maestro_types::{
        DataSchema, RequestContext, TaskId, TaskRecord, TaskStatus, TaskTemplate, TemplateId,
        TenantId, UiPriority, UiRequestDraft, UiTemplateKind,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHandler {
        response: AgentResponse,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentHandler for ScriptedHandler {
        async fn handle(
            &self,
            _definition: &AgentDefinition,
            _request: &AgentRequest,
            _snapshot: &TaskSnapshot,
            _tools: &ToolGateway,
        ) -> Result<AgentResponse, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn definition() -> AgentDefinition {
        AgentDefinition {
            agent_id: AgentId("data_collector".into()),
            version: "1.0.0".into(),
            role: "collects data".into(),
            capabilities: vec!["data_collection".into()],
            required_tools: vec![],
            input_schema: json!({
                "type": "object",
                "properties": {"instruction": {"enum": ["collect"]}}
            }),
            output_schema: Value::Null,
            mission: "collect the data".into(),
            decision_rules: vec![],
            prompt_template: String::new(),
        }
    }

    fn request(id: &str) -> AgentRequest {
        AgentRequest {
            request_id: RequestId(id.into()),
            instruction: "collect".into(),
            data: json!({}),
            context: RequestContext {
                urgency: UiPriority::Medium,
                device_type: None,
                user_progress: 0,
                subtask_description: "collect fields".into(),
                expected_output: String::new(),
                success_criteria: vec![],
            },
        }
    }

    fn snapshot(task_id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            task_id,
            template_id: TemplateId("onboarding".into()),
            status: TaskStatus::Active,
            phase: "p1".into(),
            completeness: 0,
            data: json!({}),
        }
    }

    async fn store_with_task() -> (Arc<dyn TaskStore>, TaskId) {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let task_id = TaskId::random();
        store
            .create_task(TaskRecord {
                task_id,
                tenant_id: TenantId("t1".into()),
                template_id: TemplateId("onboarding".into()),
                created_at: Utc::now(),
                template: TaskTemplate {
                    template_id: TemplateId("onboarding".into()),
                    name: "onboarding".into(),
                    description: String::new(),
                    initial_phase: "intake".into(),
                    goals: vec![],
                    data_schema: DataSchema::default(),
                    success_criteria: vec![],
                },
            })
            .await
            .unwrap();
        (store, task_id)
    }

    fn runtime(response: AgentResponse) -> AgentRuntime {
        AgentRuntime::new(
            Arc::new(ScriptedHandler {
                response,
                calls: AtomicU32::new(0),
            }),
            Arc::new(ToolGateway::new()),
        )
    }

    #[tokio::test]
    async fn test_unknown_instruction_rejected_with_audit() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();
        let runtime = runtime(AgentResponse::completed(json!({"x": 1}), "done"));

        let mut req = request("req-1");
        req.instruction = "destroy_everything".into();
        let response = runtime
            .execute(&definition(), req, &snapshot(task_id), &writer)
            .await
            .unwrap();

        assert_eq!(response.status, AgentStatus::Error);
        assert_eq!(
            response.error.as_ref().unwrap().kind,
            AgentErrorKind::UnknownInstruction
        );

        // Only the audit entry was written
        let events = store.list(task_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, ops::AGENT_DECISION);
    }

    #[tokio::test]
    async fn test_confidence_clamped_and_reasoning_defaulted() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();

        let mut scripted = AgentResponse::completed(json!({"x": 1}), "");
        scripted.confidence = 7.5;
        scripted.reasoning = None;
        let runtime = runtime(scripted);

        let response = runtime
            .execute(&definition(), request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();

        assert_eq!(response.confidence, 1.0);
        assert_eq!(response.reasoning.as_deref(), Some(REASONING_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_needs_input_opens_ui_requests() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();

        let scripted = AgentResponse {
            status: AgentStatus::NeedsInput,
            data: Value::Null,
            ui_requests: vec![UiRequestDraft {
                request_id: RequestId("r1".into()),
                template_kind: UiTemplateKind::Form,
                semantic_data: json!({"fields": ["business_name"]}),
                priority: UiPriority::High,
            }],
            reasoning: Some("missing business name".into()),
            next_agent: None,
            confidence: 0.9,
            error: None,
        };
        let runtime = runtime(scripted);

        let response = runtime
            .execute(&definition(), request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();
        assert_eq!(response.status, AgentStatus::NeedsInput);

        let events = store.list(task_id).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(kinds, vec![ops::AGENT_DECISION, ops::UI_REQUEST_CREATED]);

        let recorded = &events[1].data["request"];
        assert_eq!(recorded["request_id"], "r1");
        assert_eq!(recorded["originating_agent_id"], "data_collector");
    }

    #[tokio::test]
    async fn test_needs_input_without_requests_is_contract_violation() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();

        let mut scripted = AgentResponse::completed(Value::Null, "hmm");
        scripted.status = AgentStatus::NeedsInput;
        let runtime = runtime(scripted);

        let response = runtime
            .execute(&definition(), request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();
        assert_eq!(response.status, AgentStatus::Error);
        assert_eq!(
            response.error.unwrap().kind,
            AgentErrorKind::ContractViolation
        );
    }

    #[tokio::test]
    async fn test_output_schema_enforced() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();

        let mut def = definition();
        def.output_schema = json!({
            "type": "object",
            "required": ["business_name"],
            "properties": {"business_name": {"type": "string"}}
        });

        let runtime = runtime(AgentResponse::completed(json!({"wrong": 1}), "done"));
        let response = runtime
            .execute(&def, request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();

        assert_eq!(response.status, AgentStatus::Error);
        assert_eq!(
            response.error.unwrap().kind,
            AgentErrorKind::ContractViolation
        );
    }

    #[tokio::test]
    async fn test_repeated_request_id_replays_without_side_effects() {
        let (store, task_id) = store_with_task().await;
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();

        let handler = Arc::new(ScriptedHandler {
            response: AgentResponse::completed(json!({"x": 1}), "done"),
            calls: AtomicU32::new(0),
        });
        let runtime = AgentRuntime::new(handler.clone(), Arc::new(ToolGateway::new()));

        let first = runtime
            .execute(&definition(), request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();
        let second = runtime
            .execute(&definition(), request("req-1"), &snapshot(task_id), &writer)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}

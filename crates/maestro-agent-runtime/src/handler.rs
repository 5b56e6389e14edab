//! The agent execution seam.
//!
//! [`AgentHandler`] is where agent domain logic plugs in; the engine only
//! specifies the envelope around it. The built-in [`LlmAgentHandler`]
//! renders the definition's mission, decision rules, and prompt template
//! into a structured completion and decodes the response envelope.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use maestro_llm_gateway::{LlmGateway, LlmRequest, RequestMetadata};
use maestro_projection::TaskSnapshot;
use maestro_types::{AgentDefinition, AgentRequest, AgentResponse, EngineError};

use crate::tools::ToolGateway;

/// Executes one subtask request for one agent.
///
/// Handlers must be re-entrant and stateless across calls: all task state
/// lives in the event log and arrives through the snapshot.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Produce a response envelope for `request`.
    async fn handle(
        &self,
        definition: &AgentDefinition,
        request: &AgentRequest,
        snapshot: &TaskSnapshot,
        tools: &ToolGateway,
    ) -> Result<AgentResponse, EngineError>;
}

/// The default handler: drives the agent's declared prompt through the LLM
/// gateway and expects a response-envelope-shaped JSON object back.
pub struct LlmAgentHandler {
    gateway: Arc<LlmGateway>,
}

impl LlmAgentHandler {
    /// Build a handler over `gateway`.
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    fn system_prompt(definition: &AgentDefinition, tools: &ToolGateway) -> String {
        let rules = if definition.decision_rules.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nDecision rules:\n{}",
                definition
                    .decision_rules
                    .iter()
                    .map(|r| format!("- {r}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };

        let tool_names = tools.tool_names();
        let tools_section = if tool_names.is_empty() {
            String::new()
        } else {
            format!("\n\nAvailable tools: {}", tool_names.join(", "))
        };

        format!(
            "You are {role} (agent `{id}` v{version}).\n\nMission: {mission}{rules}{tools}\n\n\
             Reply with a JSON object shaped as:\n\
             {{\"status\": \"completed|needs_input|delegated|error\", \"data\": {{...}}, \
             \"ui_requests\": [...], \"reasoning\": \"...\", \"confidence\": 0.0}}",
            role = definition.role,
            id = definition.agent_id,
            version = definition.version,
            mission = definition.mission,
            rules = rules,
            tools = tools_section,
        )
    }

    fn user_prompt(
        definition: &AgentDefinition,
        request: &AgentRequest,
        snapshot: &TaskSnapshot,
    ) -> String {
        let context = serde_json::to_string_pretty(&request.context).unwrap_or_default();
        let data = serde_json::to_string_pretty(&request.data).unwrap_or_default();

        let rendered = if definition.prompt_template.is_empty() {
            format!(
                "Instruction: {}\n\nInput data:\n{}\n\nSubtask context:\n{}",
                request.instruction, data, context
            )
        } else {
            definition
                .prompt_template
                .replace("{instruction}", &request.instruction)
                .replace("{data}", &data)
                .replace("{context}", &context)
        };

        format!(
            "{rendered}\n\nTask so far (phase `{phase}`, {completeness}% complete):\n{task_data}",
            rendered = rendered,
            phase = snapshot.phase,
            completeness = snapshot.completeness,
            task_data = serde_json::to_string_pretty(&snapshot.data).unwrap_or_default(),
        )
    }

    fn decode_envelope(value: Value) -> Result<AgentResponse, EngineError> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::ParseFailed(format!("response envelope: {e}")))
    }
}

#[async_trait]
impl AgentHandler for LlmAgentHandler {
    async fn handle(
        &self,
        definition: &AgentDefinition,
        request: &AgentRequest,
        snapshot: &TaskSnapshot,
        tools: &ToolGateway,
    ) -> Result<AgentResponse, EngineError> {
        let llm_request = LlmRequest::new(Self::user_prompt(definition, request, snapshot))
            .map_err(EngineError::from)?
            .with_system(Self::system_prompt(definition, tools))
            .with_metadata(RequestMetadata {
                task_id: Some(snapshot.task_id),
                agent_id: Some(definition.agent_id.clone()),
                request_id: request.request_id.clone(),
                purpose: format!("agent:{}", request.instruction),
            });

        let (value, response) = self
            .gateway
            .complete_structured(llm_request)
            .await
            .map_err(EngineError::from)?;

        debug!(
            agent = %definition.agent_id,
            tokens = response.usage.total_tokens,
            "decoded agent envelope"
        );
        Self::decode_envelope(value)
    }
}

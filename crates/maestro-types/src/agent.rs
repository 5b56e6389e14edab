//! Agent definitions and the agent execution contract.
//!
//! An agent definition is loaded from configuration at process start and
//! never mutated per-task. The request/response envelope here is the whole
//! contract between the dispatcher and an agent: domain logic behind it is
//! out of scope for the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ui::UiRequestDraft;
use crate::{AgentId, RequestId, UiPriority};

/// A specialized agent as declared in the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent identifier.
    pub agent_id: AgentId,
    /// Declared version; used for tie-breaking between capable agents.
    pub version: String,
    /// Human-readable role description.
    pub role: String,
    /// Capabilities offered, matched case-sensitively and exactly.
    pub capabilities: Vec<String>,
    /// Named tools the agent may invoke through the tool gateway.
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Structural schema of accepted requests. If it declares
    /// `properties.instruction.enum`, that enumeration is the closed set of
    /// supported instructions.
    #[serde(default)]
    pub input_schema: Value,
    /// Structural schema responses must satisfy. Empty means unconstrained.
    #[serde(default)]
    pub output_schema: Value,
    /// Mission statement fed into the agent's prompt.
    pub mission: String,
    /// Decision rules fed into the agent's prompt.
    #[serde(default)]
    pub decision_rules: Vec<String>,
    /// Prompt template; `{instruction}`, `{data}`, and `{context}`
    /// placeholders are substituted at execution time.
    #[serde(default)]
    pub prompt_template: String,
}

impl AgentDefinition {
    /// Validate a definition loaded from configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_id.0.trim().is_empty() {
            return Err("agent_id cannot be empty".into());
        }
        if self.version.trim().is_empty() {
            return Err(format!("agent {} declares no version", self.agent_id));
        }
        if self.capabilities.is_empty() {
            return Err(format!("agent {} declares no capabilities", self.agent_id));
        }
        if self.mission.trim().is_empty() {
            return Err(format!("agent {} declares no mission", self.agent_id));
        }
        Ok(())
    }

    /// The closed set of instructions the definition supports, if it
    /// declares one via `input_schema.properties.instruction.enum`.
    pub fn supported_instructions(&self) -> Option<Vec<String>> {
        let values = self
            .input_schema
            .get("properties")?
            .get("instruction")?
            .get("enum")?
            .as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }
}

/// Situational context handed to an agent alongside a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// How urgent the subtask is.
    #[serde(default)]
    pub urgency: UiPriority,
    /// Device class the user is on, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Task completeness (0-100) at dispatch time.
    #[serde(default)]
    pub user_progress: u8,
    /// What this subtask is for.
    pub subtask_description: String,
    /// What shape of output the dispatcher expects.
    #[serde(default)]
    pub expected_output: String,
    /// How success will be judged.
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

/// A subtask request dispatched to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Idempotency token, stable across retries of the same subtask.
    pub request_id: RequestId,
    /// The operation the agent is asked to perform.
    pub instruction: String,
    /// Input payload for the instruction.
    pub data: Value,
    /// Situational context.
    pub context: RequestContext,
}

/// Terminal status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The subtask finished; `data` carries the result.
    Completed,
    /// The agent needs user input; `ui_requests` carries at least one
    /// request and the subtask parks on the rendezvous.
    NeedsInput,
    /// The agent recommends handing the subtask to `next_agent`.
    Delegated,
    /// The invocation failed; `error` carries the typed failure.
    Error,
}

/// Typed failure kinds an agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The instruction is outside the agent's declared set.
    UnknownInstruction,
    /// The response violated the declared output schema.
    ContractViolation,
    /// A downstream tool or model call failed.
    CallFailed,
    /// Anything else the agent chose to report.
    Other,
}

/// A typed error inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    /// Failure classification.
    pub kind: AgentErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// The response envelope returned by every agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Outcome of the invocation.
    pub status: AgentStatus,
    /// Result payload, deep-merged into task data on completion.
    #[serde(default)]
    pub data: Value,
    /// UI requests to open; required non-empty when `status` is
    /// `needs_input`.
    #[serde(default)]
    pub ui_requests: Vec<UiRequestDraft>,
    /// Why the agent did what it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Delegation target when `status` is `delegated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<AgentId>,
    /// Self-assessed confidence; the runtime clamps this to `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Failure detail when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl AgentResponse {
    /// A successful response carrying `data`.
    pub fn completed(data: Value, reasoning: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Completed,
            data,
            ui_requests: Vec::new(),
            reasoning: Some(reasoning.into()),
            next_agent: None,
            confidence: 1.0,
            error: None,
        }
    }

    /// An error response with a typed kind.
    pub fn error(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: AgentStatus::Error,
            data: Value::Null,
            ui_requests: Vec::new(),
            reasoning: Some(message.clone()),
            next_agent: None,
            confidence: 0.0,
            error: Some(AgentError { kind, message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> AgentDefinition {
        AgentDefinition {
            agent_id: AgentId("data_collector".into()),
            version: "1.0.0".into(),
            role: "Collects business data".into(),
            capabilities: vec!["data_collection".into()],
            required_tools: vec![],
            input_schema: json!({
                "type": "object",
                "properties": {
                    "instruction": {"enum": ["collect", "verify"]}
                }
            }),
            output_schema: Value::Null,
            mission: "Collect required onboarding data".into(),
            decision_rules: vec![],
            prompt_template: String::new(),
        }
    }

    #[test]
    fn test_supported_instructions_from_schema() {
        let def = definition();
        assert_eq!(
            def.supported_instructions().unwrap(),
            vec!["collect".to_string(), "verify".to_string()]
        );
    }

    #[test]
    fn test_supported_instructions_absent_when_undeclared() {
        let mut def = definition();
        def.input_schema = Value::Null;
        assert!(def.supported_instructions().is_none());
    }

    #[test]
    fn test_definition_validation() {
        let mut def = definition();
        assert!(def.validate().is_ok());
        def.capabilities.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_response_envelope_defaults() {
        let raw = json!({"status": "completed"});
        let response: AgentResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.status, AgentStatus::Completed);
        assert!(response.ui_requests.is_empty());
        assert_eq!(response.confidence, 0.0);
    }
}

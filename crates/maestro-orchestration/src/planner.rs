//! The LLM-driven planner.
//!
//! Builds a planning prompt out of the task's goals, inputs, current data,
//! and the registry's agents, asks the gateway for a structured plan, and
//! validates it: every referenced agent must exist, every prerequisite must
//! reference a declared phase, and the phase graph must be acyclic. Invalid
//! model output is recorded as a `plan_rejected` event and replaced by the
//! conservative default plan before `plan_created` is appended.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use maestro_llm_gateway::{LlmGateway, LlmRequest, RequestMetadata};
use maestro_projection::TaskContext;
use maestro_registry::AgentRegistry;
use maestro_store_core::TaskWriter;
use maestro_types::{
    ops, Actor, AgentId, EngineError, ExecutionPlan, NewEntry, PhaseId, PhasePlan, RequestId,
    Trigger,
};

use crate::config::OrchestrationConfig;
use crate::dependency::topological_order;

/// Produces execution plans for tasks.
pub struct Planner {
    gateway: Arc<LlmGateway>,
    registry: Arc<AgentRegistry>,
    config: OrchestrationConfig,
}

impl Planner {
    /// Build a planner.
    pub fn new(
        gateway: Arc<LlmGateway>,
        registry: Arc<AgentRegistry>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            gateway,
            registry,
            config,
        }
    }

    /// Produce and record an execution plan for `context`.
    ///
    /// Appends exactly one `plan_created` event; a `plan_rejected` event
    /// precedes it when the model's output failed validation and the
    /// fallback plan was used instead.
    pub async fn plan(
        &self,
        context: &TaskContext,
        writer: &TaskWriter,
    ) -> Result<ExecutionPlan, EngineError> {
        let request = LlmRequest::new(self.prompt(context))
            .map_err(EngineError::from)?
            .with_system(PLANNING_SYSTEM_PROMPT)
            .with_temperature(self.config.planning_temperature)
            .with_metadata(RequestMetadata {
                task_id: Some(context.record.task_id),
                agent_id: None,
                request_id: RequestId::random(),
                purpose: "planning".to_string(),
            });

        let plan = match self.gateway.complete_structured(request).await {
            Ok((value, _response)) => match self.decode_and_validate(value.clone()) {
                Ok(plan) => plan,
                Err(reason) => {
                    warn!(
                        task = %context.record.task_id,
                        reason = %reason,
                        "model produced an invalid plan, falling back"
                    );
                    self.record_rejection(writer, &value, &reason).await?;
                    self.fallback_plan()
                }
            },
            Err(maestro_llm_gateway::GatewayError::ParseFailed(detail)) => {
                self.record_rejection(writer, &Value::String(detail.clone()), "unparseable output")
                    .await?;
                self.fallback_plan()
            }
            Err(other) => return Err(other.into()),
        };

        let entry = NewEntry::new(
            Actor::system("planner"),
            ops::PLAN_CREATED,
            json!({ "plan": plan }),
            Trigger::system("planner"),
        )?
        .with_reasoning(format!(
            "execution plan with {} phase(s) for template {}",
            plan.phases.len(),
            context.record.template_id
        ));
        writer.append(entry).await.map_err(EngineError::from)?;

        info!(
            task = %context.record.task_id,
            phases = plan.phases.len(),
            "plan recorded"
        );
        Ok(plan)
    }

    fn prompt(&self, context: &TaskContext) -> String {
        let template = &context.record.template;
        let agents = self
            .registry
            .list_agents()
            .iter()
            .map(|def| {
                format!(
                    "- {} (v{}): {} [capabilities: {}]",
                    def.agent_id,
                    def.version,
                    def.role,
                    def.capabilities.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Plan the execution of this task.\n\n\
             Task goals:\n{goals}\n\n\
             Required inputs: {required}\n\
             Optional inputs: {optional}\n\n\
             Data collected so far:\n{data}\n\n\
             Available agents:\n{agents}\n\n\
             Produce a JSON object: {{\"plan_id\": \"...\", \"phases\": [{{\"phase_id\": \"p1\", \
             \"name\": \"...\", \"description\": \"...\", \"required_agents\": [\"...\"], \
             \"prerequisites\": [], \"parallel\": false, \"goals\": [\"...\"]}}]}}.\n\
             Reference only the agents listed above.",
            goals = bulleted(&template.goals),
            required = template.data_schema.required.join(", "),
            optional = template.data_schema.optional.join(", "),
            data = serde_json::to_string_pretty(&context.state.data).unwrap_or_default(),
            agents = agents,
        )
    }

    fn decode_and_validate(&self, value: Value) -> Result<ExecutionPlan, String> {
        // Accept both a bare plan object and one nested under "plan"
        let raw = value.get("plan").cloned().unwrap_or(value);
        let mut plan: ExecutionPlan =
            serde_json::from_value(raw).map_err(|e| format!("plan shape: {e}"))?;

        if plan.plan_id.trim().is_empty() {
            plan.plan_id = Uuid::new_v4().to_string();
        }

        plan.validate_structure()?;
        topological_order(&plan)?;

        for phase in &plan.phases {
            for agent in &phase.required_agents {
                if !self.registry.contains(agent) {
                    return Err(format!(
                        "phase {} references unknown agent {agent}",
                        phase.phase_id
                    ));
                }
            }
        }

        Ok(plan)
    }

    async fn record_rejection(
        &self,
        writer: &TaskWriter,
        raw_output: &Value,
        reason: &str,
    ) -> Result<(), EngineError> {
        let entry = NewEntry::new(
            Actor::system("planner"),
            ops::PLAN_REJECTED,
            json!({ "rejected_output": raw_output, "rejection_reason": reason }),
            Trigger::system("planner"),
        )?
        .with_reasoning(format!(
            "model plan failed validation ({reason}); using conservative default plan"
        ));
        writer.append(entry).await.map_err(EngineError::from)?;
        Ok(())
    }

    /// The conservative default: data-collection, then validation, then
    /// completion, each staffed by whichever registered agents declare the
    /// matching capability.
    pub fn fallback_plan(&self) -> ExecutionPlan {
        let staff = |capability: &str| -> Vec<AgentId> {
            let mut candidates = self.registry.find_by_capability(capability);
            candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            candidates.into_iter().map(|d| d.agent_id).collect()
        };

        let phase = |id: &str, name: &str, capability: &str, prereqs: &[&str]| PhasePlan {
            phase_id: PhaseId(id.into()),
            name: name.into(),
            description: format!("{name} (conservative default plan)"),
            required_agents: staff(capability),
            prerequisites: prereqs.iter().map(|p| PhaseId((*p).into())).collect(),
            estimated_duration: None,
            parallel: false,
            goals: vec![name.to_string()],
        };

        ExecutionPlan {
            plan_id: Uuid::new_v4().to_string(),
            phases: vec![
                phase("data_collection", "Data collection", "data_collection", &[]),
                phase("validation", "Validation", "validation", &["data_collection"]),
                phase("completion", "Completion", "completion", &["validation"]),
            ],
        }
    }
}

const PLANNING_SYSTEM_PROMPT: &str =
    "You are the planning component of a task orchestration engine. Decompose the task \
     into sequential phases, assigning only the agents you are given. Keep the plan minimal.";

fn bulleted(items: &[String]) -> String {
    if items.is_empty() {
        "- (none declared)".to_string()
    } else {
        items
            .iter()
            .map(|g| format!("- {g}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_llm_gateway::Config;

    const COLLECTOR_YAML: &str = r#"
agent_id: "data_collector"
version: "1.0.0"
role: "collects data"
capabilities:
  - "data_collection"
mission: "gather fields"
"#;

    fn planner() -> (tempfile::TempDir, Planner) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("data_collector.yaml"), COLLECTOR_YAML).unwrap();
        let registry = Arc::new(AgentRegistry::load(dir.path()).unwrap());
        let config = Config::for_tests();
        let gateway = Arc::new(maestro_llm_gateway::LlmGateway::with_provider(
            config.create_provider().unwrap(),
            &config,
        ));
        let planner = Planner::new(gateway, registry, OrchestrationConfig::default());
        (dir, planner)
    }

    #[test]
    fn test_fallback_plan_is_linear_and_staffed() {
        let (_dir, planner) = planner();
        let plan = planner.fallback_plan();

        let ids: Vec<&str> = plan.phases.iter().map(|p| p.phase_id.0.as_str()).collect();
        assert_eq!(ids, vec!["data_collection", "validation", "completion"]);
        assert_eq!(
            plan.phases[0].required_agents,
            vec![AgentId("data_collector".into())]
        );
        // No registered agent declares these capabilities
        assert!(plan.phases[1].required_agents.is_empty());
        assert!(topological_order(&plan).is_ok());
    }

    #[test]
    fn test_decode_rejects_unknown_agent() {
        let (_dir, planner) = planner();
        let raw = serde_json::json!({
            "plan_id": "plan-1",
            "phases": [
                {"phase_id": "p1", "name": "x", "required_agents": ["ghost"]}
            ]
        });
        let err = planner.decode_and_validate(raw).unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn test_decode_rejects_cycles() {
        let (_dir, planner) = planner();
        let raw = serde_json::json!({
            "phases": [
                {"phase_id": "p1", "name": "x", "required_agents": ["data_collector"],
                 "prerequisites": ["p2"]},
                {"phase_id": "p2", "name": "y", "required_agents": ["data_collector"],
                 "prerequisites": ["p1"]}
            ]
        });
        assert!(planner.decode_and_validate(raw).is_err());
    }

    #[test]
    fn test_decode_fills_missing_plan_id() {
        let (_dir, planner) = planner();
        let raw = serde_json::json!({
            "phases": [
                {"phase_id": "p1", "name": "x", "required_agents": ["data_collector"]}
            ]
        });
        let plan = planner.decode_and_validate(raw).unwrap();
        assert!(!plan.plan_id.is_empty());
    }

    #[test]
    fn test_decode_accepts_nested_plan_object() {
        let (_dir, planner) = planner();
        let raw = serde_json::json!({
            "plan": {
                "plan_id": "plan-1",
                "phases": [
                    {"phase_id": "p1", "name": "x", "required_agents": ["data_collector"]}
                ]
            }
        });
        let plan = planner.decode_and_validate(raw).unwrap();
        assert_eq!(plan.plan_id, "plan-1");
    }
}

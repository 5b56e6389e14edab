//! Execution plans produced by the planner.
//!
//! A plan is an ordered list of phases forming a DAG over `prerequisites`.
//! The dispatcher executes phases in a linear topological order; a phase
//! marked `parallel` dispatches all of its subtasks concurrently.

use serde::{Deserialize, Serialize};

use crate::{AgentId, PhaseId};

/// A validated execution plan for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan identifier, unique within the task.
    #[serde(default)]
    pub plan_id: String,
    /// Phases in declaration order.
    pub phases: Vec<PhasePlan>,
}

/// One named stage of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Phase identifier, unique within the plan.
    pub phase_id: PhaseId,
    /// Human-readable phase name.
    pub name: String,
    /// What the phase is meant to achieve.
    #[serde(default)]
    pub description: String,
    /// Agents that must execute a subtask in this phase.
    pub required_agents: Vec<AgentId>,
    /// Phases that must complete before this one starts.
    #[serde(default)]
    pub prerequisites: Vec<PhaseId>,
    /// Display-only duration estimate from the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    /// Whether this phase's subtasks run concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Goals the phase contributes to.
    #[serde(default)]
    pub goals: Vec<String>,
}

impl ExecutionPlan {
    /// Look up a phase by id.
    pub fn phase(&self, id: &PhaseId) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| &p.phase_id == id)
    }

    /// Structural validation that is independent of any registry: phase ids
    /// are unique and every prerequisite references a phase declared in this
    /// plan. Cycle detection lives with the dispatcher's ordering logic.
    pub fn validate_structure(&self) -> Result<(), String> {
        if self.phases.is_empty() {
            return Err("plan declares no phases".into());
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &self.phases {
            if !seen.insert(&phase.phase_id) {
                return Err(format!("duplicate phase id: {}", phase.phase_id));
            }
        }
        for phase in &self.phases {
            for prereq in &phase.prerequisites {
                if self.phase(prereq).is_none() {
                    return Err(format!(
                        "phase {} references undeclared prerequisite {}",
                        phase.phase_id, prereq
                    ));
                }
            }
        }
        Ok(())
    }
}

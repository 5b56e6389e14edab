//! Phase-graph ordering.
//!
//! A plan's phases form a DAG over `prerequisites`. The dispatcher executes
//! them in the linear topological order computed here; declaration order
//! breaks ties so the result is deterministic.

use std::collections::HashSet;

use maestro_types::{ExecutionPlan, PhaseId};

/// Compute a deterministic topological execution order for `plan`.
///
/// Fails when a prerequisite cycle exists or a prerequisite references an
/// undeclared phase.
pub fn topological_order(plan: &ExecutionPlan) -> Result<Vec<PhaseId>, String> {
    let mut order = Vec::with_capacity(plan.phases.len());
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();

    fn visit(
        plan: &ExecutionPlan,
        phase_id: &PhaseId,
        visited: &mut HashSet<PhaseId>,
        visiting: &mut HashSet<PhaseId>,
        order: &mut Vec<PhaseId>,
    ) -> Result<(), String> {
        if visited.contains(phase_id) {
            return Ok(());
        }
        if !visiting.insert(phase_id.clone()) {
            return Err(format!("prerequisite cycle involving phase {phase_id}"));
        }

        let phase = plan
            .phase(phase_id)
            .ok_or_else(|| format!("prerequisite references undeclared phase {phase_id}"))?;
        for prereq in &phase.prerequisites {
            visit(plan, prereq, visited, visiting, order)?;
        }

        visiting.remove(phase_id);
        visited.insert(phase_id.clone());
        order.push(phase_id.clone());
        Ok(())
    }

    for phase in &plan.phases {
        visit(plan, &phase.phase_id, &mut visited, &mut visiting, &mut order)?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::{AgentId, PhasePlan};

    fn phase(id: &str, prereqs: &[&str]) -> PhasePlan {
        PhasePlan {
            phase_id: PhaseId(id.into()),
            name: id.into(),
            description: String::new(),
            required_agents: vec![AgentId("a".into())],
            prerequisites: prereqs.iter().map(|p| PhaseId((*p).into())).collect(),
            estimated_duration: None,
            parallel: false,
            goals: vec![],
        }
    }

    fn plan(phases: Vec<PhasePlan>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: "plan-1".into(),
            phases,
        }
    }

    #[test]
    fn test_linear_order_preserved() {
        let plan = plan(vec![phase("p1", &[]), phase("p2", &["p1"]), phase("p3", &["p2"])]);
        let order = topological_order(&plan).unwrap();
        let ids: Vec<&str> = order.iter().map(|p| p.0.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_prerequisites_run_before_dependents() {
        // Declared out of order; prerequisites still come first
        let plan = plan(vec![phase("p2", &["p1"]), phase("p1", &[])]);
        let order = topological_order(&plan).unwrap();
        let ids: Vec<&str> = order.iter().map(|p| p.0.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn test_cycle_detected() {
        let plan = plan(vec![phase("p1", &["p2"]), phase("p2", &["p1"])]);
        assert!(topological_order(&plan).is_err());
    }

    #[test]
    fn test_unknown_prerequisite_detected() {
        let plan = plan(vec![phase("p1", &["ghost"])]);
        assert!(topological_order(&plan).is_err());
    }

    #[test]
    fn test_diamond_is_deterministic() {
        let plan = plan(vec![
            phase("top", &[]),
            phase("left", &["top"]),
            phase("right", &["top"]),
            phase("bottom", &["left", "right"]),
        ]);
        let order = topological_order(&plan).unwrap();
        let ids: Vec<&str> = order.iter().map(|p| p.0.as_str()).collect();
        assert_eq!(ids, vec!["top", "left", "right", "bottom"]);
    }
}

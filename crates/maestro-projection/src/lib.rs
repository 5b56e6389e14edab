#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-projection** – Deterministic state projection for Maestro.
//!
//! State lives in events; everything exposing "current state" is a facade
//! computed on demand by the pure fold in this crate. `project` applied to
//! identical event lists yields identical state in any environment, which is
//! what makes replay, time-travel, and crash recovery trustworthy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use maestro_types::{
    ops, AgentId, ContextEntry, ExecutionPlan, PhaseId, RequestId, TaskStatus, TaskTemplate,
    UiRequest, UiRequestStatus,
};

pub mod context;
pub mod merge;

pub use context::{TaskContext, TaskSnapshot};
pub use merge::{deep_merge, deep_merge_at};

/// Phase name a task is in before its `task_created` entry is folded.
pub const INITIAL_PHASE: &str = "initialization";

/// A subtask failure recorded in the projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskFailure {
    /// Agent whose subtask failed.
    pub agent_id: AgentId,
    /// Idempotency token of the failed subtask, when recorded.
    pub request_id: Option<RequestId>,
    /// Machine-readable failure kind.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

/// The current state of a task, recomputed from its event history.
///
/// Collections are ordered (`BTreeMap`/`BTreeSet`) so identical event lists
/// produce bit-for-bit identical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedState {
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Current phase name.
    pub phase: String,
    /// Required-field completeness, 0-100.
    pub completeness: u8,
    /// Accumulated domain data.
    pub data: Value,
    /// Every UI request ever opened, keyed by request id, with its current
    /// status. See [`ProjectedState::pending_user_interactions`].
    pub user_interactions: BTreeMap<RequestId, UiRequest>,
    /// Agents currently assigned to an in-flight subtask.
    pub active_agents: BTreeSet<AgentId>,
    /// Phases that have completed.
    pub completed_phases: BTreeSet<PhaseId>,
    /// Recorded subtask failures, in event order.
    pub failures: Vec<SubtaskFailure>,
    /// The recorded execution plan, once one exists.
    pub plan: Option<ExecutionPlan>,
    /// Template snapshot captured from the `task_created` entry.
    pub template: Option<TaskTemplate>,
}

impl Default for ProjectedState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Created,
            phase: INITIAL_PHASE.to_string(),
            completeness: 0,
            data: Value::Object(serde_json::Map::new()),
            user_interactions: BTreeMap::new(),
            active_agents: BTreeSet::new(),
            completed_phases: BTreeSet::new(),
            failures: Vec::new(),
            plan: None,
            template: None,
        }
    }
}

impl ProjectedState {
    /// UI requests not yet responded to or cancelled.
    pub fn pending_user_interactions(&self) -> impl Iterator<Item = &UiRequest> {
        self.user_interactions
            .values()
            .filter(|r| r.status == UiRequestStatus::Pending)
    }

    /// Whether at least one UI request is awaiting a response.
    pub fn has_pending_interactions(&self) -> bool {
        self.pending_user_interactions().next().is_some()
    }

    /// Look up one interaction by id.
    pub fn interaction(&self, request_id: &RequestId) -> Option<&UiRequest> {
        self.user_interactions.get(request_id)
    }
}

/// Compute current state from an ordered event history. Pure.
pub fn project(events: &[ContextEntry]) -> ProjectedState {
    let mut state = ProjectedState::default();
    let mut saw_task_completed = false;

    for event in events {
        apply(&mut state, event, &mut saw_task_completed);
    }

    state.completeness = completeness(&state, saw_task_completed);
    state
}

/// Compute state as of sequence `seq` (inclusive). Pure.
pub fn project_at(events: &[ContextEntry], seq: u64) -> ProjectedState {
    let upto: Vec<ContextEntry> = events
        .iter()
        .filter(|e| e.sequence <= seq)
        .cloned()
        .collect();
    project(&upto)
}

fn apply(state: &mut ProjectedState, event: &ContextEntry, saw_task_completed: &mut bool) {
    match event.operation.as_str() {
        ops::TASK_CREATED => {
            state.status = TaskStatus::Active;
            if let Some(template) = event
                .data
                .get("template")
                .and_then(|t| serde_json::from_value::<TaskTemplate>(t.clone()).ok())
            {
                state.phase = template.initial_phase.clone();
                state.template = Some(template);
            }
            if let Some(initial) = event.data.get("initial_data") {
                deep_merge(&mut state.data, initial);
            }
        }
        ops::PLAN_CREATED => {
            if let Some(plan) = event
                .data
                .get("plan")
                .and_then(|p| serde_json::from_value::<ExecutionPlan>(p.clone()).ok())
            {
                state.plan = Some(plan);
            }
            // Phase unchanged; the plan is also retained in accumulated data
            deep_merge(&mut state.data, &event.data);
        }
        ops::PHASE_STARTED => {
            if let Some(phase) = event.data.get("phase").and_then(Value::as_str) {
                state.phase = phase.to_string();
            }
        }
        ops::PHASE_COMPLETED => {
            if let Some(phase) = event.data.get("phase").and_then(Value::as_str) {
                state.completed_phases.insert(PhaseId(phase.to_string()));
            }
        }
        ops::SUBTASK_DISPATCHED => {
            if let Some(agent) = event.data.get("agent_id").and_then(Value::as_str) {
                state.active_agents.insert(AgentId(agent.to_string()));
            }
        }
        ops::SUBTASK_COMPLETED => {
            if let Some(agent) = event.data.get("agent_id").and_then(Value::as_str) {
                state.active_agents.remove(&AgentId(agent.to_string()));
            }
            if let Some(result) = event.data.get("data") {
                deep_merge(&mut state.data, result);
            }
        }
        ops::SUBTASK_FAILED | ops::SUBTASK_CANCELLED => {
            let agent_id = event
                .data
                .get("agent_id")
                .and_then(Value::as_str)
                .map(|a| AgentId(a.to_string()));
            if let Some(agent_id) = agent_id {
                state.active_agents.remove(&agent_id);
                state.failures.push(SubtaskFailure {
                    agent_id,
                    request_id: event
                        .data
                        .get("request_id")
                        .and_then(Value::as_str)
                        .map(|r| RequestId(r.to_string())),
                    kind: event
                        .data
                        .get("error_kind")
                        .and_then(Value::as_str)
                        .unwrap_or(if event.operation == ops::SUBTASK_CANCELLED {
                            "cancelled"
                        } else {
                            "error"
                        })
                        .to_string(),
                    message: event
                        .data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        ops::UI_REQUEST_CREATED => {
            if let Some(request) = event
                .data
                .get("request")
                .and_then(|r| serde_json::from_value::<UiRequest>(r.clone()).ok())
            {
                state.user_interactions.insert(request.request_id.clone(), request);
            }
        }
        ops::UI_RESPONSE_RECEIVED => {
            let request_id = event
                .data
                .get("request_id")
                .and_then(Value::as_str)
                .map(|r| RequestId(r.to_string()));
            if let Some(request_id) = request_id {
                let path = state
                    .user_interactions
                    .get(&request_id)
                    .and_then(|r| r.semantic_data.get("data_path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(request) = state.user_interactions.get_mut(&request_id) {
                    request.status = UiRequestStatus::Responded;
                }
                if let Some(response) = event.data.get("response") {
                    deep_merge_at(&mut state.data, &path, response);
                }
            }
        }
        ops::UI_REQUEST_CANCELLED => {
            let request_id = event
                .data
                .get("request_id")
                .and_then(Value::as_str)
                .map(|r| RequestId(r.to_string()));
            if let Some(request_id) = request_id {
                if let Some(request) = state.user_interactions.get_mut(&request_id) {
                    request.status = UiRequestStatus::Cancelled;
                }
            }
        }
        ops::TASK_COMPLETED => {
            state.status = TaskStatus::Completed;
            *saw_task_completed = true;
        }
        ops::TASK_FAILED => {
            state.status = TaskStatus::Failed;
        }
        ops::TASK_CANCELLED => {
            state.status = TaskStatus::Cancelled;
        }
        other => {
            debug!(operation = other, "folding unknown operation as data merge");
            deep_merge(&mut state.data, &event.data);
        }
    }

    // A task with pending questions is waiting; it resumes once they clear
    if !state.status.is_terminal() && state.status != TaskStatus::Created {
        state.status = if state.has_pending_interactions() {
            TaskStatus::WaitingForInput
        } else {
            TaskStatus::Active
        };
    }
}

fn completeness(state: &ProjectedState, saw_task_completed: bool) -> u8 {
    if saw_task_completed {
        return 100;
    }
    let Some(template) = &state.template else {
        return 0;
    };
    let total = template.data_schema.required.len();
    if total == 0 {
        // Nothing required: completeness only reaches 100 via task_completed
        return 0;
    }
    let present = template.data_schema.required_present(&state.data);
    ((present * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::{
        Actor, DataSchema, EntryId, NewEntry, TemplateId, Trigger, UiPriority, UiTemplateKind,
    };
    use proptest::prelude::*;
    use serde_json::json;

    fn entry(seq: u64, op: &str, data: Value) -> ContextEntry {
        NewEntry::new(Actor::system("test"), op, data, Trigger::system("test"))
            .unwrap()
            .into_entry(seq)
    }

    fn template_value() -> Value {
        serde_json::to_value(TaskTemplate {
            template_id: TemplateId("onboarding".into()),
            name: "User onboarding".into(),
            description: String::new(),
            initial_phase: "intake".into(),
            goals: vec![],
            data_schema: DataSchema {
                required: vec!["email".into(), "business_name".into()],
                optional: vec![],
            },
            success_criteria: vec![],
        })
        .unwrap()
    }

    fn ui_request_value(request_id: &str) -> Value {
        serde_json::to_value(UiRequest {
            request_id: RequestId(request_id.into()),
            template_kind: UiTemplateKind::Form,
            semantic_data: json!({"fields": ["business_name"]}),
            priority: UiPriority::Medium,
            created_at: Utc::now(),
            status: UiRequestStatus::Pending,
            originating_event_id: EntryId::random(),
            originating_agent_id: AgentId("data_collector".into()),
        })
        .unwrap()
    }

    #[test]
    fn test_task_created_activates_and_seeds_data() {
        let events = vec![entry(
            1,
            ops::TASK_CREATED,
            json!({"template": template_value(), "initial_data": {"email": "a@b.io"}}),
        )];
        let state = project(&events);
        assert_eq!(state.status, TaskStatus::Active);
        assert_eq!(state.phase, "intake");
        assert_eq!(state.data["email"], "a@b.io");
        assert_eq!(state.completeness, 50);
    }

    #[test]
    fn test_pending_interaction_switches_to_waiting() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::UI_REQUEST_CREATED, json!({"request": ui_request_value("r1")})),
        ];
        let state = project(&events);
        assert_eq!(state.status, TaskStatus::WaitingForInput);
        assert_eq!(state.pending_user_interactions().count(), 1);
    }

    #[test]
    fn test_response_resumes_and_merges_payload() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {"email": "a@b.io"}}),
            ),
            entry(2, ops::UI_REQUEST_CREATED, json!({"request": ui_request_value("r1")})),
            entry(
                3,
                ops::UI_RESPONSE_RECEIVED,
                json!({"request_id": "r1", "response": {"business_name": "Acme"}}),
            ),
        ];
        let state = project(&events);
        assert_eq!(state.status, TaskStatus::Active);
        assert_eq!(state.data["business_name"], "Acme");
        assert_eq!(
            state.interaction(&RequestId("r1".into())).unwrap().status,
            UiRequestStatus::Responded
        );
        assert_eq!(state.completeness, 100);
    }

    #[test]
    fn test_response_respects_declared_data_path() {
        let mut request = ui_request_value("r1");
        request["semantic_data"]["data_path"] = json!("business.profile");
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::UI_REQUEST_CREATED, json!({"request": request})),
            entry(
                3,
                ops::UI_RESPONSE_RECEIVED,
                json!({"request_id": "r1", "response": {"legal_name": "Acme"}}),
            ),
        ];
        let state = project(&events);
        assert_eq!(state.data["business"]["profile"]["legal_name"], "Acme");
    }

    #[test]
    fn test_subtask_lifecycle_tracks_active_agents() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(
                2,
                ops::SUBTASK_DISPATCHED,
                json!({"agent_id": "data_collector", "request_id": "req-1"}),
            ),
        ];
        let state = project(&events);
        assert!(state.active_agents.contains(&AgentId("data_collector".into())));

        let mut events = events;
        events.push(entry(
            3,
            ops::SUBTASK_COMPLETED,
            json!({"agent_id": "data_collector", "request_id": "req-1", "data": {"x": 1}}),
        ));
        let state = project(&events);
        assert!(state.active_agents.is_empty());
        assert_eq!(state.data["x"], 1);
    }

    #[test]
    fn test_subtask_failure_recorded() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(
                2,
                ops::SUBTASK_DISPATCHED,
                json!({"agent_id": "data_collector", "request_id": "req-1"}),
            ),
            entry(
                3,
                ops::SUBTASK_FAILED,
                json!({
                    "agent_id": "data_collector",
                    "request_id": "req-1",
                    "error_kind": "unknown_instruction",
                    "message": "no such instruction"
                }),
            ),
        ];
        let state = project(&events);
        assert!(state.active_agents.is_empty());
        assert_eq!(state.failures.len(), 1);
        assert_eq!(state.failures[0].kind, "unknown_instruction");
    }

    #[test]
    fn test_terminal_events_are_final() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::TASK_COMPLETED, json!({})),
        ];
        let state = project(&events);
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.completeness, 100);

        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::TASK_CANCELLED, json!({"reason": "user request"})),
        ];
        assert_eq!(project(&events).status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_unknown_operations_merge_their_data() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, "compliance_scan_finished", json!({"scan": {"score": 97}})),
        ];
        let state = project(&events);
        assert_eq!(state.data["scan"]["score"], 97);
    }

    #[test]
    fn test_plan_created_retained_in_state_and_data() {
        let plan = json!({
            "plan_id": "plan-1",
            "phases": [
                {"phase_id": "p1", "name": "collect", "required_agents": ["data_collector"]}
            ]
        });
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::PLAN_CREATED, json!({"plan": plan})),
        ];
        let state = project(&events);
        assert_eq!(state.plan.as_ref().unwrap().phases.len(), 1);
        assert_eq!(state.data["plan"]["plan_id"], "plan-1");
        // plan_created leaves the phase untouched
        assert_eq!(state.phase, "intake");
    }

    #[test]
    fn test_project_at_time_travels() {
        let events = vec![
            entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            ),
            entry(2, ops::PHASE_STARTED, json!({"phase": "p1"})),
            entry(3, ops::TASK_COMPLETED, json!({})),
        ];
        let at_two = project_at(&events, 2);
        assert_eq!(at_two.status, TaskStatus::Active);
        assert_eq!(at_two.phase, "p1");

        let at_three = project_at(&events, 3);
        assert_eq!(at_three.status, TaskStatus::Completed);
    }

    //─────────────────────────────
    //  Property tests
    //─────────────────────────────

    fn arb_operation() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(ops::PHASE_STARTED.to_string()),
            Just(ops::SUBTASK_DISPATCHED.to_string()),
            Just(ops::SUBTASK_COMPLETED.to_string()),
            Just("custom_merge".to_string()),
        ]
    }

    fn arb_events() -> impl Strategy<Value = Vec<ContextEntry>> {
        prop::collection::vec(
            (arb_operation(), "[a-z]{1,8}", 0u64..100),
            0..20,
        )
        .prop_map(|specs| {
            let mut events = vec![entry(
                1,
                ops::TASK_CREATED,
                json!({"template": template_value(), "initial_data": {}}),
            )];
            for (i, (op, key, value)) in specs.into_iter().enumerate() {
                events.push(entry(
                    (i + 2) as u64,
                    &op,
                    json!({
                        "agent_id": key,
                        "phase": key,
                        "data": {key.clone(): value},
                        key: value
                    }),
                ));
            }
            events
        })
    }

    proptest! {
        #[test]
        fn prop_projection_is_deterministic(events in arb_events()) {
            let first = project(&events);
            let second = project(&events);
            prop_assert_eq!(
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            );
        }

        #[test]
        fn prop_completeness_stays_bounded(events in arb_events()) {
            let state = project(&events);
            prop_assert!(state.completeness <= 100);
        }

        #[test]
        fn prop_null_merge_never_erases(key in "[a-z]{1,8}", value in 0u64..100) {
            let mut base = json!({ key.clone(): value });
            let snapshot = base.clone();
            deep_merge(&mut base, &json!({ key: null }));
            prop_assert_eq!(base, snapshot);
        }
    }
}

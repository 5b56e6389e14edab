#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-types** – Shared primitive data structures for Maestro.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines task identity, the event (context entry) record, execution
//! plans, UI requests, agent definitions, task templates, and the engine-wide
//! error taxonomy. It intentionally makes no assumptions about I/O or storage.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod agent;
pub mod error;
pub mod plan;
pub mod template;
pub mod ui;

pub use agent::{
    AgentDefinition, AgentError, AgentErrorKind, AgentRequest, AgentResponse, AgentStatus,
    RequestContext,
};
pub use error::EngineError;
pub use plan::{ExecutionPlan, PhasePlan};
pub use template::{DataSchema, TaskTemplate};
pub use ui::{UiPriority, UiRequest, UiRequestDraft, UiRequestStatus, UiTemplateKind};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum allowed length of an event operation name.
pub const MAX_OPERATION_LEN: usize = 128;

/// Maximum allowed length of a `reasoning` string carried by an event.
pub const MAX_REASONING_LEN: usize = 16_384;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Unique, immutable identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Allocate a fresh random task identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of a single context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Allocate a fresh random entry identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tenant isolation boundary. All task operations are scoped to one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a task template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub String);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a specialized agent, as declared in its definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a phase within an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(pub String);

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Idempotency token carried by subtask dispatches, UI requests, and tool
/// invocations. Two invocations with the same `RequestId` must produce the
/// same external side effect at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Allocate a fresh random request identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

//─────────────────────────────
//  Actors and triggers
//─────────────────────────────

/// The kind of principal responsible for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// A human user.
    User,
    /// A specialized agent.
    Agent,
    /// The engine itself.
    System,
}

/// The principal that caused an event to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Principal kind.
    pub kind: ActorKind,
    /// Principal identifier (user id, agent id, or engine component name).
    pub id: String,
    /// Optional version of the acting component.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Actor {
    /// An event written by the engine itself.
    pub fn system(component: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::System,
            id: component.into(),
            version: None,
        }
    }

    /// An event written on behalf of an agent.
    pub fn agent(id: &AgentId, version: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: id.0.clone(),
            version: Some(version.into()),
        }
    }

    /// An event written on behalf of a human user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::User,
            id: id.into(),
            version: None,
        }
    }
}

/// The kind of stimulus that triggered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A direct user action (e.g. submitting a UI response).
    UserAction,
    /// A request issued by an agent.
    AgentRequest,
    /// An internal engine event (scheduling, recovery, timeouts).
    SystemEvent,
}

/// What caused an event to be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Stimulus kind.
    pub kind: TriggerKind,
    /// Component or surface that originated the stimulus.
    pub source: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Trigger {
    /// A trigger originating from the engine itself.
    pub fn system(source: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::SystemEvent,
            source: source.into(),
            details: None,
        }
    }

    /// A trigger originating from an agent request.
    pub fn agent(source: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::AgentRequest,
            source: source.into(),
            details: None,
        }
    }

    /// A trigger originating from a user action.
    pub fn user(source: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::UserAction,
            source: source.into(),
            details: None,
        }
    }
}

//─────────────────────────────
//  Context entries (events)
//─────────────────────────────

/// Well-known event operation names.
///
/// Operations are plain strings on the wire; the projector folds the
/// operations listed here per their specific transition and deep-merges the
/// `data` of anything else.
pub mod ops {
    /// Task was created; payload carries the template snapshot.
    pub const TASK_CREATED: &str = "task_created";
    /// A validated execution plan was recorded.
    pub const PLAN_CREATED: &str = "plan_created";
    /// The planner rejected malformed model output and fell back.
    pub const PLAN_REJECTED: &str = "plan_rejected";
    /// A plan phase began executing.
    pub const PHASE_STARTED: &str = "phase_started";
    /// A plan phase finished (all subtasks terminal).
    pub const PHASE_COMPLETED: &str = "phase_completed";
    /// A subtask was handed to an agent.
    pub const SUBTASK_DISPATCHED: &str = "subtask_dispatched";
    /// A subtask finished successfully.
    pub const SUBTASK_COMPLETED: &str = "subtask_completed";
    /// A subtask failed.
    pub const SUBTASK_FAILED: &str = "subtask_failed";
    /// A subtask was abandoned due to cancellation.
    pub const SUBTASK_CANCELLED: &str = "subtask_cancelled";
    /// An agent asked the user a structured question.
    pub const UI_REQUEST_CREATED: &str = "ui_request_created";
    /// The user answered a pending UI request.
    pub const UI_RESPONSE_RECEIVED: &str = "ui_response_received";
    /// A pending UI request was withdrawn.
    pub const UI_REQUEST_CANCELLED: &str = "ui_request_cancelled";
    /// Terminal: the task completed.
    pub const TASK_COMPLETED: &str = "task_completed";
    /// Terminal: the task failed.
    pub const TASK_FAILED: &str = "task_failed";
    /// Terminal: the task was cancelled.
    pub const TASK_CANCELLED: &str = "task_cancelled";
    /// Audit record of an agent decision with no other observable effect.
    pub const AGENT_DECISION: &str = "agent_decision";
}

/// A single immutable record of change to a task.
///
/// Entries are append-only: once written they are never mutated or deleted,
/// and `sequence` strictly increases by one per task. The `timestamp` is for
/// display only and never used for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Unique, immutable entry identifier.
    pub entry_id: EntryId,
    /// Position in the task's total order; starts at 1, gap-free.
    pub sequence: u64,
    /// Wall-clock commit time (display only).
    pub timestamp: DateTime<Utc>,
    /// Who wrote the entry.
    pub actor: Actor,
    /// Short string identifying the event kind; see [`ops`].
    pub operation: String,
    /// Operation-dependent semi-structured payload.
    pub data: Value,
    /// Free-form explanation of the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// What caused the entry to be written.
    pub trigger: Trigger,
}

/// A context entry before the log has assigned its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    /// Who is writing the entry.
    pub actor: Actor,
    /// Short string identifying the event kind; see [`ops`].
    pub operation: String,
    /// Operation-dependent semi-structured payload.
    pub data: Value,
    /// Free-form explanation of the change.
    pub reasoning: Option<String>,
    /// What caused the entry to be written.
    pub trigger: Trigger,
}

impl NewEntry {
    /// Create a new draft entry with validation.
    pub fn new(
        actor: Actor,
        operation: impl Into<String>,
        data: Value,
        trigger: Trigger,
    ) -> Result<Self, EngineError> {
        let operation = operation.into();
        if operation.trim().is_empty() {
            return Err(EngineError::Validation(
                "event operation cannot be empty".into(),
            ));
        }
        if operation.len() > MAX_OPERATION_LEN {
            return Err(EngineError::Validation(format!(
                "event operation too long: {} > {}",
                operation.len(),
                MAX_OPERATION_LEN
            )));
        }
        Ok(Self {
            actor,
            operation,
            data,
            reasoning: None,
            trigger,
        })
    }

    /// Attach a human-readable explanation, truncated to the allowed bound.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        let mut reasoning = reasoning.into();
        if reasoning.len() > MAX_REASONING_LEN {
            reasoning.truncate(MAX_REASONING_LEN);
        }
        self.reasoning = Some(reasoning);
        self
    }

    /// Materialize the draft into a committed entry at `sequence`.
    pub fn into_entry(self, sequence: u64) -> ContextEntry {
        ContextEntry {
            entry_id: EntryId::random(),
            sequence,
            timestamp: Utc::now(),
            actor: self.actor,
            operation: self.operation,
            data: self.data,
            reasoning: self.reasoning,
            trigger: self.trigger,
        }
    }
}

//─────────────────────────────
//  Task identity and status
//─────────────────────────────

/// Lifecycle status of a task, derived from its event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task exists but no `task_created` entry has been folded yet.
    Created,
    /// Task is being driven by the dispatcher.
    Active,
    /// Task has at least one pending UI request.
    WaitingForInput,
    /// Terminal: all phases completed.
    Completed,
    /// Terminal: the task failed.
    Failed,
    /// Terminal: the task was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further state-changing events may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Immutable identity of a task plus the template snapshot taken at creation.
///
/// The snapshot guarantees that later template mutations never rewrite the
/// semantics of a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier.
    pub task_id: TaskId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Template the task was created from.
    pub template_id: TemplateId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Snapshot of the template as of creation.
    pub template: TaskTemplate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_validation() {
        let actor = Actor::system("test");
        let trigger = Trigger::system("test");

        assert!(NewEntry::new(actor.clone(), "", json!({}), trigger.clone()).is_err());
        assert!(NewEntry::new(actor.clone(), "   ", json!({}), trigger.clone()).is_err());
        assert!(
            NewEntry::new(actor.clone(), "x".repeat(MAX_OPERATION_LEN + 1), json!({}), trigger.clone())
                .is_err()
        );
        assert!(NewEntry::new(actor, ops::TASK_CREATED, json!({}), trigger).is_ok());
    }

    #[test]
    fn test_into_entry_assigns_identity() {
        let draft = NewEntry::new(
            Actor::system("lifecycle"),
            ops::TASK_CREATED,
            json!({"hello": "world"}),
            Trigger::system("create_task"),
        )
        .unwrap()
        .with_reasoning("task created from template");

        let entry = draft.into_entry(1);
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.operation, ops::TASK_CREATED);
        assert_eq!(entry.reasoning.as_deref(), Some("task created from template"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
        assert!(!TaskStatus::WaitingForInput.is_terminal());
    }

    #[test]
    fn test_entry_round_trips_through_json() {
        let entry = NewEntry::new(
            Actor::agent(&AgentId("data_collector".into()), "1.2.0"),
            ops::SUBTASK_COMPLETED,
            json!({"business_name": "Acme"}),
            Trigger::agent("dispatcher"),
        )
        .unwrap()
        .into_entry(7);

        let serialized = serde_json::to_string(&entry).unwrap();
        let deserialized: ContextEntry = serde_json::from_str(&serialized).unwrap();
        assert_eq!(entry, deserialized);
    }
}

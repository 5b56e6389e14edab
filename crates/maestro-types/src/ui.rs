//! Structured UI requests emitted by agents.
//!
//! A UI request carries the agent's *intent* (fields wanted, choices
//! offered, prompt text) as semantic data with no presentation encoding;
//! rendering is the front end's concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AgentId, EntryId, RequestId};

/// Closed enumeration of renderable request shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiTemplateKind {
    /// Free-form field collection.
    Form,
    /// Yes/no or acknowledge.
    Confirmation,
    /// Pick one (or more) of the offered choices.
    Selection,
    /// File or document upload.
    Upload,
    /// Progress display, no input expected.
    Progress,
    /// Error display.
    Error,
    /// Success display.
    Success,
    /// Waiting display.
    Waiting,
}

/// Urgency of a UI request, used by the front end for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiPriority {
    /// Can wait indefinitely.
    Low,
    /// Default.
    Medium,
    /// Should be answered soon.
    High,
    /// Blocks time-critical work.
    Urgent,
}

impl Default for UiPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Lifecycle of a UI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiRequestStatus {
    /// Awaiting a user response.
    Pending,
    /// Terminal: answered.
    Responded,
    /// Terminal: withdrawn (explicitly or by timeout).
    Cancelled,
}

/// A UI request as proposed by an agent, before the runtime records it.
///
/// The runtime fills in creation time and originating identifiers when it
/// appends the corresponding `ui_request_created` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiRequestDraft {
    /// Idempotency token; also the rendezvous correlation key.
    pub request_id: RequestId,
    /// Renderable shape.
    pub template_kind: UiTemplateKind,
    /// The agent's intent: field list, choices, prompt. No presentation
    /// encoding.
    pub semantic_data: Value,
    /// Urgency hint.
    #[serde(default)]
    pub priority: UiPriority,
}

/// A recorded UI request, reconstructed from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiRequest {
    /// Idempotency token; also the rendezvous correlation key.
    pub request_id: RequestId,
    /// Renderable shape.
    pub template_kind: UiTemplateKind,
    /// The agent's intent with no presentation encoding.
    pub semantic_data: Value,
    /// Urgency hint.
    pub priority: UiPriority,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: UiRequestStatus,
    /// The `ui_request_created` entry that introduced this request.
    pub originating_event_id: EntryId,
    /// Agent that asked.
    pub originating_agent_id: AgentId,
}

impl UiRequest {
    /// Promote a draft into a recorded request.
    pub fn from_draft(
        draft: UiRequestDraft,
        created_at: DateTime<Utc>,
        originating_event_id: EntryId,
        originating_agent_id: AgentId,
    ) -> Self {
        Self {
            request_id: draft.request_id,
            template_kind: draft.template_kind,
            semantic_data: draft.semantic_data,
            priority: draft.priority,
            created_at,
            status: UiRequestStatus::Pending,
            originating_event_id,
            originating_agent_id,
        }
    }
}

//! The read-facing task aggregate.
//!
//! A [`TaskContext`] is identity + template snapshot + projected state,
//! loaded fresh on every call: after any append, the next load reflects the
//! appended event. Nothing here is cached across writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use maestro_store_core::{StoreError, TaskStore};
use maestro_types::{TaskId, TaskRecord, TaskStatus, TemplateId};

use crate::{project, project_at, ProjectedState};

/// The aggregate exposing a task's identity and current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Identity and template snapshot.
    pub record: TaskRecord,
    /// State projected from the full event history.
    pub state: ProjectedState,
    /// Sequence of the newest event folded into `state`.
    pub latest_sequence: u64,
}

impl TaskContext {
    /// Load the aggregate: fetch all events and project.
    pub async fn load(store: &dyn TaskStore, task_id: TaskId) -> Result<Self, StoreError> {
        let record = store
            .task_record(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let events = store.list(task_id).await?;
        let latest_sequence = events.last().map(|e| e.sequence).unwrap_or(0);
        Ok(Self {
            record,
            state: project(&events),
            latest_sequence,
        })
    }

    /// Load the aggregate as of a historical sequence point.
    pub async fn load_at(
        store: &dyn TaskStore,
        task_id: TaskId,
        seq: u64,
    ) -> Result<Self, StoreError> {
        let record = store
            .task_record(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let events = store.list(task_id).await?;
        Ok(Self {
            record,
            state: project_at(&events, seq),
            latest_sequence: seq,
        })
    }

    /// A read-only snapshot suitable for handing to agents.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.record.task_id,
            template_id: self.record.template_id.clone(),
            status: self.state.status,
            phase: self.state.phase.clone(),
            completeness: self.state.completeness,
            data: self.state.data.clone(),
        }
    }
}

/// An immutable view of projected state passed into the agent runtime.
///
/// Agents never share a mutable aggregate; each invocation gets its own
/// copy, which breaks the cyclic reference between agents and the context
/// their past outputs produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub task_id: TaskId,
    /// Template the task was created from.
    pub template_id: TemplateId,
    /// Lifecycle status at snapshot time.
    pub status: TaskStatus,
    /// Phase at snapshot time.
    pub phase: String,
    /// Completeness at snapshot time.
    pub completeness: u8,
    /// Accumulated domain data at snapshot time.
    pub data: Value,
}

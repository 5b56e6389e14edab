#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-store-core** – Core storage abstractions for Maestro.
//!
//! This crate defines the contracts for event persistence without providing
//! concrete implementations. The event log is an append-only, totally
//! ordered store of context entries per task; the task index is the
//! key-value side table mapping task ids to tenancy and freshness metadata.
//!
//! Storage drivers (in-memory, SQLite, etc.) implement these traits in
//! separate crates that depend on this core abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use maestro_types::{
    ops, ContextEntry, EngineError, NewEntry, TaskId, TaskRecord, TaskStatus, TemplateId, TenantId,
};

/// Maximum reload-and-retry attempts a [`TaskWriter`] makes on a
/// `concurrent_write` conflict before giving up.
pub const MAX_APPEND_ATTEMPTS: usize = 8;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced by storage drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer appended since the caller observed the tail.
    #[error("concurrent write on task {task}: expected tail {expected}, found {actual}")]
    ConcurrentWrite {
        /// Task whose log rejected the append.
        task: TaskId,
        /// Tail sequence the writer declared.
        expected: u64,
        /// Tail sequence actually present.
        actual: u64,
    },
    /// The task does not exist (or is invisible to the calling tenant).
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// A task record already exists under this id.
    #[error("task already exists: {0}")]
    TaskExists(TaskId),
    /// Entry (de)serialization failed.
    #[error("failed to serialize entry: {0}")]
    Serialization(String),
    /// The backend failed in a driver-specific way.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentWrite {
                task,
                expected,
                actual,
            } => EngineError::ConcurrentWrite {
                task,
                expected,
                actual,
            },
            StoreError::TaskNotFound(task) => EngineError::NotFound(format!("task {task}")),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

//─────────────────────────────
//  Task index
//─────────────────────────────

/// Freshness and routing metadata kept per task, coherent with the log.
///
/// The `status` here is a coarse hint maintained on append; the
/// authoritative status is always the projection of the full event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIndexEntry {
    /// Task identifier.
    pub task_id: TaskId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Template the task was created from.
    pub template_id: TemplateId,
    /// Sequence number of the newest entry.
    pub latest_sequence: u64,
    /// Coarse status hint.
    pub status: TaskStatus,
    /// When the newest entry was appended.
    pub updated_at: DateTime<Utc>,
}

/// Derive the coarse index status a freshly appended operation implies,
/// `None` when the operation leaves the hint unchanged.
pub fn index_status_hint(operation: &str) -> Option<TaskStatus> {
    match operation {
        ops::TASK_CREATED => Some(TaskStatus::Active),
        ops::UI_REQUEST_CREATED => Some(TaskStatus::WaitingForInput),
        ops::UI_RESPONSE_RECEIVED | ops::UI_REQUEST_CANCELLED => Some(TaskStatus::Active),
        ops::TASK_COMPLETED => Some(TaskStatus::Completed),
        ops::TASK_FAILED => Some(TaskStatus::Failed),
        ops::TASK_CANCELLED => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

//─────────────────────────────
//  Storage traits
//─────────────────────────────

/// Append-only ordered store of context entries, one totally ordered
/// sequence per task.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append `entry` as sequence `expected_tail + 1`.
    ///
    /// Fails with [`StoreError::ConcurrentWrite`] if another writer has
    /// appended since the caller observed `expected_tail`. Retry policy is
    /// the caller's; [`TaskWriter`] implements the standard reload-and-retry
    /// loop.
    async fn append(
        &self,
        task_id: TaskId,
        expected_tail: u64,
        entry: NewEntry,
    ) -> Result<ContextEntry, StoreError>;

    /// All entries of a task in sequence order.
    async fn list(&self, task_id: TaskId) -> Result<Vec<ContextEntry>, StoreError>;

    /// Entries with sequence strictly greater than `seq`, in order.
    async fn list_since(&self, task_id: TaskId, seq: u64) -> Result<Vec<ContextEntry>, StoreError>;

    /// Sequence number of the newest entry, 0 for an empty log.
    async fn latest_sequence(&self, task_id: TaskId) -> Result<u64, StoreError>;

    /// Live stream of entries appended to the task.
    ///
    /// Delivery is at-least-once and in sequence order; consumers dedup by
    /// `sequence`. Subscribers that fall behind may observe a lagged
    /// stream and must rescan via [`EventLog::list_since`].
    async fn watch(&self, task_id: TaskId) -> Result<broadcast::Receiver<ContextEntry>, StoreError>;
}

/// Key-value side table of task records and index entries.
#[async_trait]
pub trait TaskIndex: Send + Sync {
    /// Register a new task. Fails with [`StoreError::TaskExists`] on
    /// duplicate ids.
    async fn create_task(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// The immutable task record (identity + template snapshot).
    async fn task_record(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// The mutable index entry for a task.
    async fn index_entry(&self, task_id: TaskId) -> Result<Option<TaskIndexEntry>, StoreError>;

    /// Update freshness metadata after an append.
    async fn update_index(
        &self,
        task_id: TaskId,
        latest_sequence: u64,
        status: Option<TaskStatus>,
    ) -> Result<(), StoreError>;

    /// Every task whose coarse status is non-terminal, for recovery.
    async fn list_open(&self) -> Result<Vec<TaskIndexEntry>, StoreError>;
}

/// A complete task store: event log plus index, maintained coherently.
pub trait TaskStore: EventLog + TaskIndex {}

impl<T> TaskStore for T where T: EventLog + TaskIndex {}

//─────────────────────────────
//  Task writer
//─────────────────────────────

/// Serialized writer for a single task's log.
///
/// Holds the observed tail behind a mutex so that all appends within one
/// task funnel through a single ordered path, and owns the standard
/// reload-and-retry loop for `concurrent_write` conflicts. The index entry
/// is refreshed after every successful append.
pub struct TaskWriter {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    tail: Mutex<u64>,
}

impl TaskWriter {
    /// Attach a writer to `task_id`, observing the current tail.
    pub async fn attach(store: Arc<dyn TaskStore>, task_id: TaskId) -> Result<Self, StoreError> {
        let tail = store.latest_sequence(task_id).await?;
        Ok(Self {
            store,
            task_id,
            tail: Mutex::new(tail),
        })
    }

    /// A writer for a task known to be empty (just created).
    pub fn new_empty(store: Arc<dyn TaskStore>, task_id: TaskId) -> Self {
        Self {
            store,
            task_id,
            tail: Mutex::new(0),
        }
    }

    /// The task this writer appends to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The tail sequence as of the last append or attach.
    pub async fn observed_tail(&self) -> u64 {
        *self.tail.lock().await
    }

    /// Append one entry, retrying bounded times on write conflicts.
    pub async fn append(&self, entry: NewEntry) -> Result<ContextEntry, StoreError> {
        let mut tail = self.tail.lock().await;
        let mut last_conflict = None;

        for _ in 0..MAX_APPEND_ATTEMPTS {
            match self.store.append(self.task_id, *tail, entry.clone()).await {
                Ok(committed) => {
                    *tail = committed.sequence;
                    let hint = index_status_hint(&committed.operation);
                    self.store
                        .update_index(self.task_id, committed.sequence, hint)
                        .await?;
                    return Ok(committed);
                }
                Err(StoreError::ConcurrentWrite {
                    task,
                    expected,
                    actual,
                }) => {
                    warn!(
                        task = %task,
                        expected,
                        actual,
                        "append conflict, reloading tail"
                    );
                    *tail = actual;
                    last_conflict = Some(StoreError::ConcurrentWrite {
                        task,
                        expected,
                        actual,
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_conflict.unwrap_or(StoreError::Backend(
            "append retry budget exhausted".into(),
        )))
    }
}

//─────────────────────────────
//  Tenant scoping
//─────────────────────────────

/// Tenancy guard over a [`TaskStore`].
///
/// Every operation first resolves the task record and rejects tenant
/// mismatches as `TaskNotFound`, indistinguishable from genuine absence so
/// that existence cannot be probed across tenants.
pub struct TenantScopedStore {
    inner: Arc<dyn TaskStore>,
    tenant: TenantId,
}

impl TenantScopedStore {
    /// Scope `inner` to `tenant`.
    pub fn new(inner: Arc<dyn TaskStore>, tenant: TenantId) -> Self {
        Self { inner, tenant }
    }

    /// The tenant this view is scoped to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    async fn check(&self, task_id: TaskId) -> Result<TaskRecord, StoreError> {
        match self.inner.task_record(task_id).await? {
            Some(record) if record.tenant_id == self.tenant => Ok(record),
            _ => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    /// The task record, if the task belongs to this tenant.
    pub async fn task_record(&self, task_id: TaskId) -> Result<TaskRecord, StoreError> {
        self.check(task_id).await
    }

    /// All events of a tenant-owned task.
    pub async fn list(&self, task_id: TaskId) -> Result<Vec<ContextEntry>, StoreError> {
        self.check(task_id).await?;
        self.inner.list(task_id).await
    }

    /// Tail slice of a tenant-owned task.
    pub async fn list_since(
        &self,
        task_id: TaskId,
        seq: u64,
    ) -> Result<Vec<ContextEntry>, StoreError> {
        self.check(task_id).await?;
        self.inner.list_since(task_id, seq).await
    }

    /// A serialized writer for a tenant-owned task.
    pub async fn writer(&self, task_id: TaskId) -> Result<TaskWriter, StoreError> {
        self.check(task_id).await?;
        TaskWriter::attach(Arc::clone(&self.inner), task_id).await
    }
}

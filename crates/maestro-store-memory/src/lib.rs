#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-store-memory** – In-memory storage driver for Maestro.
//!
//! This crate provides a fast, non-persistent task store suitable for
//! testing, development, and scenarios where event persistence is not
//! required. All data is stored in memory and will be lost when the process
//! terminates. The entire engine test suite runs against this driver.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use maestro_store_core::{EventLog, StoreError, TaskIndex, TaskIndexEntry};
use maestro_types::{ContextEntry, NewEntry, TaskId, TaskRecord, TaskStatus};

/// Default buffer size for per-task live event channels.
const DEFAULT_BUFFER: usize = 256;

/// An in-memory, non-persistent task store.
///
/// Events are held in per-task vectors whose index position mirrors the
/// sequence number, which makes the gap-free invariant structural. Each
/// task gets its own broadcast channel for live watchers.
pub struct MemoryStore {
    logs: RwLock<HashMap<TaskId, Vec<ContextEntry>>>,
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    index: RwLock<HashMap<TaskId, TaskIndexEntry>>,
    watchers: RwLock<HashMap<TaskId, broadcast::Sender<ContextEntry>>>,
    buffer_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Creates a store with a custom watch-channel buffer size.
    ///
    /// The buffer size determines how many entries can be queued for slow
    /// watchers before they observe a lagged stream and must rescan.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            buffer_size,
        }
    }

    /// Number of registered tasks.
    pub async fn task_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Total number of stored entries across all tasks.
    pub async fn entry_count(&self) -> usize {
        self.logs.read().await.values().map(Vec::len).sum()
    }

    /// Drop all tasks, entries, and watchers.
    pub async fn clear(&self) {
        self.logs.write().await.clear();
        self.records.write().await.clear();
        self.index.write().await.clear();
        self.watchers.write().await.clear();
    }

    async fn sender(&self, task_id: TaskId) -> broadcast::Sender<ContextEntry> {
        let mut watchers = self.watchers.write().await;
        watchers
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(
        &self,
        task_id: TaskId,
        expected_tail: u64,
        entry: NewEntry,
    ) -> Result<ContextEntry, StoreError> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let actual = log.len() as u64;
        if actual != expected_tail {
            return Err(StoreError::ConcurrentWrite {
                task: task_id,
                expected: expected_tail,
                actual,
            });
        }

        let committed = entry.into_entry(actual + 1);
        log.push(committed.clone());
        drop(logs);

        // Ignore send errors: no live watchers is fine
        let _ = self.sender(task_id).await.send(committed.clone());

        Ok(committed)
    }

    async fn list(&self, task_id: TaskId) -> Result<Vec<ContextEntry>, StoreError> {
        let logs = self.logs.read().await;
        logs.get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_since(&self, task_id: TaskId, seq: u64) -> Result<Vec<ContextEntry>, StoreError> {
        let logs = self.logs.read().await;
        let log = logs
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        Ok(log.iter().filter(|e| e.sequence > seq).cloned().collect())
    }

    async fn latest_sequence(&self, task_id: TaskId) -> Result<u64, StoreError> {
        let logs = self.logs.read().await;
        let log = logs
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        Ok(log.len() as u64)
    }

    async fn watch(
        &self,
        task_id: TaskId,
    ) -> Result<broadcast::Receiver<ContextEntry>, StoreError> {
        if !self.logs.read().await.contains_key(&task_id) {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(self.sender(task_id).await.subscribe())
    }
}

#[async_trait]
impl TaskIndex for MemoryStore {
    async fn create_task(&self, record: TaskRecord) -> Result<(), StoreError> {
        let task_id = record.task_id;
        let mut records = self.records.write().await;
        if records.contains_key(&task_id) {
            return Err(StoreError::TaskExists(task_id));
        }

        self.index.write().await.insert(
            task_id,
            TaskIndexEntry {
                task_id,
                tenant_id: record.tenant_id.clone(),
                template_id: record.template_id.clone(),
                latest_sequence: 0,
                status: TaskStatus::Created,
                updated_at: record.created_at,
            },
        );
        self.logs.write().await.insert(task_id, Vec::new());
        records.insert(task_id, record);
        Ok(())
    }

    async fn task_record(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&task_id).cloned())
    }

    async fn index_entry(&self, task_id: TaskId) -> Result<Option<TaskIndexEntry>, StoreError> {
        Ok(self.index.read().await.get(&task_id).cloned())
    }

    async fn update_index(
        &self,
        task_id: TaskId,
        latest_sequence: u64,
        status: Option<TaskStatus>,
    ) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        let entry = index
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        entry.latest_sequence = latest_sequence;
        entry.updated_at = Utc::now();
        if let Some(status) = status {
            entry.status = status;
        }
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<TaskIndexEntry>, StoreError> {
        let index = self.index.read().await;
        let mut open: Vec<_> = index
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|e| e.updated_at);
        Ok(open)
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-store-sqlite** – SQLite-based persistent storage driver for
//! Maestro.
//!
//! This crate provides a durable task store using the SQLite database engine
//! via sqlx. Per-task atomic append with sequence assignment rides on a
//! `(task_id, seq)` primary key: a conflicting insert is a constraint
//! violation, which surfaces as `concurrent_write`. The task index lives in
//! the same database and is updated in the same transaction as each append.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, RwLock};

use maestro_store_core::{EventLog, StoreError, TaskIndex, TaskIndexEntry};
use maestro_types::{ContextEntry, NewEntry, TaskId, TaskRecord, TaskStatus, TemplateId, TenantId};
use uuid::Uuid;

/// Default broadcast channel size for live event streaming.
const DEFAULT_BROADCAST_SIZE: usize = 256;

/// A persistent task store backed by SQLite.
///
/// Two tables: `task_events` holds the append-only per-task sequences,
/// `tasks` holds the immutable record plus the mutable index columns.
/// Live watchers are served from an in-process broadcast layered over the
/// committed writes; cross-process subscribers must poll `list_since`.
pub struct SqliteStore {
    pool: SqlitePool,
    watchers: RwLock<HashMap<TaskId, broadcast::Sender<ContextEntry>>>,
}

impl SqliteStore {
    /// Opens or creates a database at the given filesystem path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await.map_err(backend)?;
        Self::from_pool(pool).await
    }

    /// Opens an in-memory database, useful for tests.
    ///
    /// The pool is pinned to a single connection: every pooled connection to
    /// `:memory:` would otherwise get its own private database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            watchers: RwLock::new(HashMap::new()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                record BLOB NOT NULL,
                latest_sequence INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_events (
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                entry BLOB NOT NULL,
                PRIMARY KEY (task_id, seq)
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn sender(&self, task_id: TaskId) -> broadcast::Sender<ContextEntry> {
        let mut watchers = self.watchers.write().await;
        watchers
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(DEFAULT_BROADCAST_SIZE).0)
            .clone()
    }

    async fn stored_tail(&self, task_id: TaskId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT latest_sequence FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(row.get::<i64, _>("latest_sequence") as u64),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.is_unique_violation()
    )
}

fn status_str(status: TaskStatus) -> String {
    status.to_string()
}

fn status_from_str(s: &str) -> Result<TaskStatus, StoreError> {
    match s {
        "created" => Ok(TaskStatus::Created),
        "active" => Ok(TaskStatus::Active),
        "waiting_for_input" => Ok(TaskStatus::WaitingForInput),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(StoreError::Serialization(format!(
            "unknown task status: {other}"
        ))),
    }
}

fn timestamp_from_str(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp: {e}")))
}

fn parse_task_id(s: &str) -> Result<TaskId, StoreError> {
    Uuid::from_str(s)
        .map(TaskId)
        .map_err(|e| StoreError::Serialization(format!("bad task id: {e}")))
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(
        &self,
        task_id: TaskId,
        expected_tail: u64,
        entry: NewEntry,
    ) -> Result<ContextEntry, StoreError> {
        let committed = entry.into_entry(expected_tail + 1);
        let payload = rmp_serde::to_vec_named(&committed)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT latest_sequence FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let actual = match row {
            Some(row) => row.get::<i64, _>("latest_sequence") as u64,
            None => return Err(StoreError::TaskNotFound(task_id)),
        };
        if actual != expected_tail {
            return Err(StoreError::ConcurrentWrite {
                task: task_id,
                expected: expected_tail,
                actual,
            });
        }

        let insert = sqlx::query("INSERT INTO task_events (task_id, seq, entry) VALUES (?, ?, ?)")
            .bind(task_id.to_string())
            .bind(committed.sequence as i64)
            .bind(&payload)
            .execute(&mut *tx)
            .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                drop(tx);
                let actual = self.stored_tail(task_id).await.unwrap_or(expected_tail + 1);
                return Err(StoreError::ConcurrentWrite {
                    task: task_id,
                    expected: expected_tail,
                    actual,
                });
            }
            return Err(backend(err));
        }

        sqlx::query("UPDATE tasks SET latest_sequence = ?, updated_at = ? WHERE task_id = ?")
            .bind(committed.sequence as i64)
            .bind(committed.timestamp.to_rfc3339())
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        // Ignore send errors: no live watchers is fine
        let _ = self.sender(task_id).await.send(committed.clone());

        Ok(committed)
    }

    async fn list(&self, task_id: TaskId) -> Result<Vec<ContextEntry>, StoreError> {
        self.stored_tail(task_id).await?;
        let rows = sqlx::query("SELECT entry FROM task_events WHERE task_id = ? ORDER BY seq")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| {
                rmp_serde::from_slice(row.get::<Vec<u8>, _>("entry").as_slice())
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn list_since(&self, task_id: TaskId, seq: u64) -> Result<Vec<ContextEntry>, StoreError> {
        self.stored_tail(task_id).await?;
        let rows =
            sqlx::query("SELECT entry FROM task_events WHERE task_id = ? AND seq > ? ORDER BY seq")
                .bind(task_id.to_string())
                .bind(seq as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.into_iter()
            .map(|row| {
                rmp_serde::from_slice(row.get::<Vec<u8>, _>("entry").as_slice())
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn latest_sequence(&self, task_id: TaskId) -> Result<u64, StoreError> {
        self.stored_tail(task_id).await
    }

    async fn watch(
        &self,
        task_id: TaskId,
    ) -> Result<broadcast::Receiver<ContextEntry>, StoreError> {
        self.stored_tail(task_id).await?;
        Ok(self.sender(task_id).await.subscribe())
    }
}

#[async_trait]
impl TaskIndex for SqliteStore {
    async fn create_task(&self, record: TaskRecord) -> Result<(), StoreError> {
        let payload = rmp_serde::to_vec_named(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, tenant_id, template_id, record,
                               latest_sequence, status, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(record.task_id.to_string())
        .bind(record.tenant_id.0.clone())
        .bind(record.template_id.0.clone())
        .bind(&payload)
        .bind(status_str(TaskStatus::Created))
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::TaskExists(record.task_id)),
            Err(err) => Err(backend(err)),
        }
    }

    async fn task_record(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => rmp_serde::from_slice(row.get::<Vec<u8>, _>("record").as_slice())
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn index_entry(&self, task_id: TaskId) -> Result<Option<TaskIndexEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, tenant_id, template_id, latest_sequence, status, updated_at \
             FROM tasks WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(index_entry_from_row).transpose()
    }

    async fn update_index(
        &self,
        task_id: TaskId,
        latest_sequence: u64,
        status: Option<TaskStatus>,
    ) -> Result<(), StoreError> {
        let result = match status {
            Some(status) => {
                sqlx::query(
                    "UPDATE tasks SET latest_sequence = ?, status = ?, updated_at = ? \
                     WHERE task_id = ?",
                )
                .bind(latest_sequence as i64)
                .bind(status_str(status))
                .bind(Utc::now().to_rfc3339())
                .bind(task_id.to_string())
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET latest_sequence = ?, updated_at = ? WHERE task_id = ?",
                )
                .bind(latest_sequence as i64)
                .bind(Utc::now().to_rfc3339())
                .bind(task_id.to_string())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<TaskIndexEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, tenant_id, template_id, latest_sequence, status, updated_at \
             FROM tasks WHERE status NOT IN ('completed', 'failed', 'cancelled') \
             ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(index_entry_from_row).collect()
    }
}

fn index_entry_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskIndexEntry, StoreError> {
    Ok(TaskIndexEntry {
        task_id: parse_task_id(row.get::<String, _>("task_id").as_str())?,
        tenant_id: TenantId(row.get::<String, _>("tenant_id")),
        template_id: TemplateId(row.get::<String, _>("template_id")),
        latest_sequence: row.get::<i64, _>("latest_sequence") as u64,
        status: status_from_str(row.get::<String, _>("status").as_str())?,
        updated_at: timestamp_from_str(row.get::<String, _>("updated_at").as_str())?,
    })
}

//! Task lifecycle management.
//!
//! Creation snapshots the template into the `task_created` payload so the
//! task's history is closed under its own events; recovery re-drives every
//! open task inside the configured window and marks anything older as
//! failed with `reason = recovery_timeout`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use maestro_projection::project;
use maestro_registry::TemplateRegistry;
use maestro_store_core::{TaskStore, TaskWriter};
use maestro_types::{
    ops, Actor, EngineError, NewEntry, TaskId, TaskRecord, TemplateId, TenantId, Trigger,
};

use crate::config::OrchestrationConfig;
use crate::dispatcher::Dispatcher;

/// Result of a startup recovery sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Tasks re-driven by the dispatcher.
    pub resumed: Vec<TaskId>,
    /// Tasks older than the recovery window, marked failed.
    pub expired: Vec<TaskId>,
}

/// Creates, recovers, and cancels tasks.
pub struct LifecycleManager {
    store: Arc<dyn TaskStore>,
    templates: Arc<TemplateRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: OrchestrationConfig,
}

impl LifecycleManager {
    /// Build a lifecycle manager.
    pub fn new(
        store: Arc<dyn TaskStore>,
        templates: Arc<TemplateRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            store,
            templates,
            dispatcher,
            config,
        }
    }

    /// Create a task from a template, seeding its event log.
    ///
    /// The template snapshot rides inside the `task_created` payload, so
    /// later template edits never rewrite this task's history semantics.
    pub async fn create(
        &self,
        tenant_id: TenantId,
        actor: Actor,
        template_id: &TemplateId,
        initial_data: Value,
    ) -> Result<TaskId, EngineError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| EngineError::NotFound(format!("template {template_id}")))?;

        if !initial_data.is_object() && !initial_data.is_null() {
            return Err(EngineError::Validation(
                "initial_data must be an object".into(),
            ));
        }

        let task_id = TaskId::random();
        let record = TaskRecord {
            task_id,
            tenant_id,
            template_id: template_id.clone(),
            created_at: Utc::now(),
            template: template.clone(),
        };
        self.store
            .create_task(record)
            .await
            .map_err(EngineError::from)?;

        let writer = TaskWriter::new_empty(Arc::clone(&self.store), task_id);
        let entry = NewEntry::new(
            actor,
            ops::TASK_CREATED,
            json!({ "template": template, "initial_data": initial_data }),
            Trigger::user("create_task"),
        )?
        .with_reasoning(format!("task created from template {template_id}"));
        writer.append(entry).await.map_err(EngineError::from)?;

        info!(task = %task_id, template = %template_id, "task created");
        Ok(task_id)
    }

    /// Recover in-flight tasks after a restart.
    ///
    /// Every task whose latest event is non-terminal and recent enough is
    /// re-driven; the rest are marked failed. Resumption is concurrent and
    /// failures to resume one task never block the others.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let open = self.store.list_open().await.map_err(EngineError::from)?;
        let now = Utc::now();
        let window = self.config.recovery_window();

        let mut report = RecoveryReport::default();
        for index_entry in open {
            let age = (now - index_entry.updated_at)
                .to_std()
                .unwrap_or_default();
            let task_id = index_entry.task_id;

            // The index status is a hint; double-check against the projection
            let events = self.store.list(task_id).await.map_err(EngineError::from)?;
            if project(&events).status.is_terminal() {
                continue;
            }

            if age > window {
                warn!(task = %task_id, age_secs = age.as_secs(), "task beyond recovery window");
                let writer = TaskWriter::attach(Arc::clone(&self.store), task_id)
                    .await
                    .map_err(EngineError::from)?;
                let entry = NewEntry::new(
                    Actor::system("lifecycle"),
                    ops::TASK_FAILED,
                    json!({ "reason": "recovery_timeout" }),
                    Trigger::system("recover"),
                )?
                .with_reasoning(format!(
                    "last update {}s ago exceeds the {}s recovery window",
                    age.as_secs(),
                    window.as_secs()
                ));
                writer.append(entry).await.map_err(EngineError::from)?;
                report.expired.push(task_id);
            } else {
                report.resumed.push(task_id);
            }
        }

        let resumptions = futures::future::join_all(
            report
                .resumed
                .iter()
                .map(|task_id| self.dispatcher.resume(*task_id)),
        )
        .await;
        for (task_id, result) in report.resumed.iter().zip(resumptions) {
            if let Err(e) = result {
                warn!(task = %task_id, error = %e, "resume failed during recovery");
            }
        }

        info!(
            resumed = report.resumed.len(),
            expired = report.expired.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Cancel a task, stopping any active driver.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        actor: Actor,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.dispatcher.cancel(task_id, actor, reason).await
    }
}

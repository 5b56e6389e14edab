//! UI request / response rendezvous.
//!
//! Pairs a UI request with its response across a process boundary and time.
//! All rendezvous state lives in the event log: `open` and `submit_response`
//! append entries, `wait` observes them, and a `wait` issued after a process
//! restart reattaches purely by `request_id`. The subscription is taken
//! *before* history is scanned so a response landing in between is never
//! lost; duplicates from the at-least-once stream are dropped by sequence.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_projection::project;
use maestro_store_core::{TaskStore, TaskWriter};
use maestro_types::{
    ops, Actor, ContextEntry, EngineError, NewEntry, RequestId, TaskId, Trigger, UiRequest,
    UiRequestStatus,
};

/// Handle to a pending UI request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    /// Task the request belongs to.
    pub task_id: TaskId,
    /// Correlation key.
    pub request_id: RequestId,
}

/// What the log says about a request right now.
enum Resolution {
    Pending,
    Responded(ContextEntry),
    Cancelled,
    Unknown,
}

/// The rendezvous between agents asking questions and users answering them.
pub struct Rendezvous {
    store: Arc<dyn TaskStore>,
}

impl Rendezvous {
    /// Build a rendezvous over the task store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Record a UI request, putting the task into `waiting_for_input`.
    pub async fn open(
        &self,
        writer: &TaskWriter,
        request: UiRequest,
        actor: Actor,
    ) -> Result<PendingHandle, EngineError> {
        let handle = PendingHandle {
            task_id: writer.task_id(),
            request_id: request.request_id.clone(),
        };
        let entry = NewEntry::new(
            actor,
            ops::UI_REQUEST_CREATED,
            json!({ "request": request }),
            Trigger::agent("rendezvous"),
        )?
        .with_reasoning("opened user interaction");
        writer.append(entry).await.map_err(EngineError::from)?;
        info!(task = %handle.task_id, request = %handle.request_id, "ui request opened");
        Ok(handle)
    }

    /// Block until the matching response arrives, the timeout elapses, or
    /// cancellation fires.
    ///
    /// Timeout expiry cancels the request (`reason = timeout`) before the
    /// error is returned, so projections never show a stuck pending request.
    pub async fn wait(
        &self,
        handle: &PendingHandle,
        writer: &TaskWriter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ContextEntry, EngineError> {
        // Subscribe before scanning so nothing lands in the gap
        let mut rx = self
            .store
            .watch(handle.task_id)
            .await
            .map_err(EngineError::from)?;

        let mut seen_tail = 0u64;
        match self.resolve(handle, &mut seen_tail).await? {
            Resolution::Responded(entry) => return Ok(entry),
            Resolution::Cancelled => return Err(EngineError::Cancelled),
            Resolution::Unknown => {
                return Err(EngineError::NotFound(format!(
                    "ui request {}",
                    handle.request_id
                )))
            }
            Resolution::Pending => {}
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = &mut deadline => {
                    warn!(
                        task = %handle.task_id,
                        request = %handle.request_id,
                        "ui wait timed out, cancelling request"
                    );
                    self.cancel(writer, &handle.request_id, "timeout", Actor::system("rendezvous"))
                        .await?;
                    return Err(EngineError::Timeout(format!(
                        "ui request {} unanswered after {timeout:?}",
                        handle.request_id
                    )));
                }
                received = rx.recv() => match received {
                    Ok(entry) => {
                        // At-least-once stream: drop anything already scanned
                        if entry.sequence <= seen_tail {
                            continue;
                        }
                        seen_tail = entry.sequence;
                        if let Some(result) = Self::classify(&entry, &handle.request_id) {
                            return result;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "watch stream lagged, rescanning history");
                        match self.resolve(handle, &mut seen_tail).await? {
                            Resolution::Responded(entry) => return Ok(entry),
                            Resolution::Cancelled => return Err(EngineError::Cancelled),
                            _ => {}
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(EngineError::Storage("event watch closed".into()))
                    }
                },
            }
        }
    }

    /// Record the user's answer. Idempotent in `request_id`: a second
    /// submission is rejected as `already_responded` with no append.
    pub async fn submit_response(
        &self,
        writer: &TaskWriter,
        request_id: &RequestId,
        payload: Value,
        actor: Actor,
    ) -> Result<ContextEntry, EngineError> {
        let events = self
            .store
            .list(writer.task_id())
            .await
            .map_err(EngineError::from)?;
        let state = project(&events);

        match state.interaction(request_id).map(|r| r.status) {
            None => {
                return Err(EngineError::NotFound(format!("ui request {request_id}")))
            }
            Some(UiRequestStatus::Responded) => {
                return Err(EngineError::AlreadyResponded(request_id.clone()))
            }
            Some(UiRequestStatus::Cancelled) => return Err(EngineError::Cancelled),
            Some(UiRequestStatus::Pending) => {}
        }

        let entry = NewEntry::new(
            actor,
            ops::UI_RESPONSE_RECEIVED,
            json!({ "request_id": request_id, "response": payload }),
            Trigger::user("submit_ui_response"),
        )?
        .with_reasoning("user answered pending interaction");
        let committed = writer.append(entry).await.map_err(EngineError::from)?;
        info!(task = %writer.task_id(), request = %request_id, "ui response recorded");
        Ok(committed)
    }

    /// Withdraw a pending request. A request that is already terminal is
    /// left untouched.
    pub async fn cancel(
        &self,
        writer: &TaskWriter,
        request_id: &RequestId,
        reason: &str,
        actor: Actor,
    ) -> Result<Option<ContextEntry>, EngineError> {
        let events = self
            .store
            .list(writer.task_id())
            .await
            .map_err(EngineError::from)?;
        let state = project(&events);
        match state.interaction(request_id).map(|r| r.status) {
            Some(UiRequestStatus::Pending) => {}
            _ => return Ok(None),
        }

        let entry = NewEntry::new(
            actor,
            ops::UI_REQUEST_CANCELLED,
            json!({ "request_id": request_id, "reason": reason }),
            Trigger::system("rendezvous"),
        )?
        .with_reasoning(format!("interaction withdrawn: {reason}"));
        let committed = writer.append(entry).await.map_err(EngineError::from)?;
        Ok(Some(committed))
    }

    /// Pending requests reconstructed from the log, for recovery.
    pub async fn pending(&self, task_id: TaskId) -> Result<Vec<UiRequest>, EngineError> {
        let events = self.store.list(task_id).await.map_err(EngineError::from)?;
        Ok(project(&events)
            .pending_user_interactions()
            .cloned()
            .collect())
    }

    async fn resolve(
        &self,
        handle: &PendingHandle,
        seen_tail: &mut u64,
    ) -> Result<Resolution, EngineError> {
        let events = self
            .store
            .list(handle.task_id)
            .await
            .map_err(EngineError::from)?;
        *seen_tail = events.last().map(|e| e.sequence).unwrap_or(0).max(*seen_tail);

        let state = project(&events);
        Ok(match state.interaction(&handle.request_id).map(|r| r.status) {
            None => Resolution::Unknown,
            Some(UiRequestStatus::Cancelled) => Resolution::Cancelled,
            Some(UiRequestStatus::Responded) => {
                let entry = events
                    .into_iter()
                    .find(|e| {
                        e.operation == ops::UI_RESPONSE_RECEIVED
                            && e.data.get("request_id").and_then(Value::as_str)
                                == Some(handle.request_id.0.as_str())
                    })
                    .ok_or_else(|| {
                        EngineError::Storage("responded request without response event".into())
                    })?;
                Resolution::Responded(entry)
            }
            Some(UiRequestStatus::Pending) => Resolution::Pending,
        })
    }

    fn classify(
        entry: &ContextEntry,
        request_id: &RequestId,
    ) -> Option<Result<ContextEntry, EngineError>> {
        let matches = entry.data.get("request_id").and_then(Value::as_str)
            == Some(request_id.0.as_str());
        if !matches {
            return None;
        }
        match entry.operation.as_str() {
            ops::UI_RESPONSE_RECEIVED => Some(Ok(entry.clone())),
            ops::UI_REQUEST_CANCELLED => Some(Err(EngineError::Cancelled)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_store_memory::MemoryStore;
    use maestro_types::{
        AgentId, DataSchema, EntryId, TaskRecord, TaskTemplate, TemplateId, TenantId, UiPriority,
        UiTemplateKind,
    };

    async fn setup() -> (Arc<dyn TaskStore>, TaskId, TaskWriter) {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let task_id = TaskId::random();
        store
            .create_task(TaskRecord {
                task_id,
                tenant_id: TenantId("t1".into()),
                template_id: TemplateId("onboarding".into()),
                created_at: Utc::now(),
                template: TaskTemplate {
                    template_id: TemplateId("onboarding".into()),
                    name: "onboarding".into(),
                    description: String::new(),
                    initial_phase: "intake".into(),
                    goals: vec![],
                    data_schema: DataSchema::default(),
                    success_criteria: vec![],
                },
            })
            .await
            .unwrap();
        let writer = TaskWriter::attach(Arc::clone(&store), task_id).await.unwrap();
        (store, task_id, writer)
    }

    fn request(id: &str) -> UiRequest {
        UiRequest {
            request_id: RequestId(id.into()),
            template_kind: UiTemplateKind::Form,
            semantic_data: serde_json::json!({"fields": ["business_name"]}),
            priority: UiPriority::Medium,
            created_at: Utc::now(),
            status: UiRequestStatus::Pending,
            originating_event_id: EntryId::random(),
            originating_agent_id: AgentId("data_collector".into()),
        }
    }

    #[tokio::test]
    async fn test_open_then_submit_resolves_wait() {
        let (store, _task_id, writer) = setup().await;
        let rendezvous = Rendezvous::new(Arc::clone(&store));

        let handle = rendezvous
            .open(&writer, request("r1"), Actor::agent(&AgentId("data_collector".into()), "1.0"))
            .await
            .unwrap();

        rendezvous
            .submit_response(
                &writer,
                &RequestId("r1".into()),
                serde_json::json!({"business_name": "Acme"}),
                Actor::user("u1"),
            )
            .await
            .unwrap();

        // Wait after the response is already recorded: resolves immediately
        let cancel = CancellationToken::new();
        let entry = rendezvous
            .wait(&handle, &writer, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(entry.operation, ops::UI_RESPONSE_RECEIVED);
        assert_eq!(entry.data["response"]["business_name"], "Acme");
    }

    #[tokio::test]
    async fn test_wait_observes_live_response() {
        let (store, _task_id, writer) = setup().await;
        let rendezvous = Arc::new(Rendezvous::new(Arc::clone(&store)));

        let handle = rendezvous
            .open(&writer, request("r1"), Actor::user("agent"))
            .await
            .unwrap();

        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            let store = Arc::clone(&store);
            let handle = handle.clone();
            tokio::spawn(async move {
                let writer = TaskWriter::attach(store, handle.task_id).await.unwrap();
                let cancel = CancellationToken::new();
                rendezvous
                    .wait(&handle, &writer, Duration::from_secs(5), &cancel)
                    .await
            })
        };

        // Give the waiter a moment to park
        tokio::time::sleep(Duration::from_millis(20)).await;
        rendezvous
            .submit_response(
                &writer,
                &RequestId("r1".into()),
                serde_json::json!({"business_name": "Acme"}),
                Actor::user("u1"),
            )
            .await
            .unwrap();

        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.data["request_id"], "r1");
    }

    #[tokio::test]
    async fn test_duplicate_response_rejected_without_append() {
        let (store, task_id, writer) = setup().await;
        let rendezvous = Rendezvous::new(Arc::clone(&store));

        rendezvous
            .open(&writer, request("r1"), Actor::user("agent"))
            .await
            .unwrap();
        rendezvous
            .submit_response(&writer, &RequestId("r1".into()), serde_json::json!({}), Actor::user("u1"))
            .await
            .unwrap();

        let before = store.list(task_id).await.unwrap().len();
        let err = rendezvous
            .submit_response(&writer, &RequestId("r1".into()), serde_json::json!({}), Actor::user("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResponded(_)));
        assert_eq!(store.list(task_id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_unknown_request_not_found() {
        let (store, _task_id, writer) = setup().await;
        let rendezvous = Rendezvous::new(Arc::clone(&store));
        let err = rendezvous
            .submit_response(&writer, &RequestId("ghost".into()), serde_json::json!({}), Actor::user("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_cancels_request() {
        let (store, task_id, writer) = setup().await;
        let rendezvous = Rendezvous::new(Arc::clone(&store));

        let handle = rendezvous
            .open(&writer, request("r1"), Actor::user("agent"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let err = rendezvous
            .wait(&handle, &writer, Duration::from_millis(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        // The request itself transitioned to cancelled
        let events = store.list(task_id).await.unwrap();
        let state = project(&events);
        assert_eq!(
            state.interaction(&RequestId("r1".into())).unwrap().status,
            UiRequestStatus::Cancelled
        );
        let cancelled = events
            .iter()
            .find(|e| e.operation == ops::UI_REQUEST_CANCELLED)
            .unwrap();
        assert_eq!(cancelled.data["reason"], "timeout");
    }

    #[tokio::test]
    async fn test_cancellation_token_aborts_wait() {
        let (store, _task_id, writer) = setup().await;
        let rendezvous = Rendezvous::new(Arc::clone(&store));

        let handle = rendezvous
            .open(&writer, request("r1"), Actor::user("agent"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rendezvous
            .wait(&handle, &writer, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_reattach_after_restart() {
        let (store, task_id, writer) = setup().await;

        {
            // First "process": open and drop everything in-memory
            let rendezvous = Rendezvous::new(Arc::clone(&store));
            rendezvous
                .open(&writer, request("r1"), Actor::user("agent"))
                .await
                .unwrap();
        }

        // Second "process": pending state reconstructed purely from the log
        let rendezvous = Rendezvous::new(Arc::clone(&store));
        let pending = rendezvous.pending(task_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, RequestId("r1".into()));

        let handle = PendingHandle {
            task_id,
            request_id: RequestId("r1".into()),
        };
        rendezvous
            .submit_response(&writer, &RequestId("r1".into()), serde_json::json!({"ok": true}), Actor::user("u1"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let entry = rendezvous
            .wait(&handle, &writer, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(entry.data["response"]["ok"], true);
    }
}

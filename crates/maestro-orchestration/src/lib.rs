#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-orchestration** – Planner, dispatcher, rendezvous, and task
//! lifecycle for Maestro.
//!
//! This crate is the top of the engine: it turns a created task into an
//! execution plan, drives the plan's phases through specialized agents,
//! pairs agent questions with user answers, and recovers in-flight tasks
//! after a restart.
//!
//! ## Architecture
//!
//! - **Planner**: interrogates the LLM gateway for an execution plan and
//!   validates it against the agent registry
//! - **Dispatcher**: drives phases and subtasks, routes failures through the
//!   recovery advisor, parks on pending user input
//! - **Rendezvous**: pairs `ui_request_created` with `ui_response_received`
//!   across process restarts
//! - **LifecycleManager**: creation, startup recovery, cancellation
//! - **Engine**: the tenant-scoped control surface tying it all together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use maestro_orchestration::{Engine, OrchestrationConfig};
//! use maestro_agent_runtime::{AgentRuntime, LlmAgentHandler, ToolGateway};
//! use maestro_llm_gateway::{Config, LlmGateway};
//! use maestro_registry::{AgentRegistry, TemplateRegistry};
//! use maestro_store_memory::MemoryStore;
//! use maestro_types::{Actor, TemplateId, TenantId};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let registry = Arc::new(AgentRegistry::load("config/agents")?);
//! let templates = Arc::new(TemplateRegistry::load("config/templates")?);
//! let gateway = Arc::new(LlmGateway::new(Config::from_env()?)?);
//! let runtime = Arc::new(AgentRuntime::new(
//!     Arc::new(LlmAgentHandler::new(Arc::clone(&gateway))),
//!     Arc::new(ToolGateway::new()),
//! ));
//!
//! let engine = Engine::new(
//!     store,
//!     registry,
//!     templates,
//!     gateway,
//!     runtime,
//!     OrchestrationConfig::default(),
//! );
//!
//! let tenant = TenantId("tenant-a".into());
//! let task_id = engine
//!     .create_task(
//!         tenant.clone(),
//!         Actor::user("u1"),
//!         &TemplateId("onboarding".into()),
//!         serde_json::json!({"email": "a@b.io"}),
//!     )
//!     .await?;
//! engine.run_task(task_id).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use maestro_agent_runtime::AgentRuntime;
use maestro_llm_gateway::LlmGateway;
use maestro_projection::TaskContext;
use maestro_registry::{AgentRegistry, TemplateRegistry};
use maestro_store_core::{TaskStore, TenantScopedStore};
use maestro_types::{
    Actor, ContextEntry, EngineError, RequestId, TaskId, TemplateId, TenantId,
};

pub mod config;
pub mod dependency;
pub mod dispatcher;
pub mod lifecycle;
pub mod planner;
pub mod rendezvous;

pub use config::OrchestrationConfig;
pub use dependency::topological_order;
pub use dispatcher::{Dispatcher, RecoveryAction, RunReport};
pub use lifecycle::{LifecycleManager, RecoveryReport};
pub use planner::Planner;
pub use rendezvous::{PendingHandle, Rendezvous};

/// The engine's control surface.
///
/// Every dependency is injected at construction so tests can instantiate an
/// independent engine with stubbed gateways and handlers. All caller-facing
/// operations take the caller's tenant; cross-tenant access is rejected by
/// the persistence layer as `not_found`.
pub struct Engine {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<LifecycleManager>,
    rendezvous: Arc<Rendezvous>,
}

impl Engine {
    /// Wire up an engine from its collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateRegistry>,
        gateway: Arc<LlmGateway>,
        runtime: Arc<AgentRuntime>,
        config: OrchestrationConfig,
    ) -> Self {
        let rendezvous = Arc::new(Rendezvous::new(Arc::clone(&store)));
        let planner = Arc::new(Planner::new(
            Arc::clone(&gateway),
            Arc::clone(&registry),
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            registry,
            runtime,
            Arc::clone(&rendezvous),
            gateway,
            planner,
            config.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            templates,
            Arc::clone(&dispatcher),
            config,
        ));

        Self {
            store,
            dispatcher,
            lifecycle,
            rendezvous,
        }
    }

    /// Create a task from a template. The task is registered and seeded but
    /// not yet driven; call [`Engine::run_task`] (or let a UI response
    /// trigger resumption) to make progress.
    pub async fn create_task(
        &self,
        tenant: TenantId,
        actor: Actor,
        template_id: &TemplateId,
        initial_data: Value,
    ) -> Result<TaskId, EngineError> {
        self.lifecycle
            .create(tenant, actor, template_id, initial_data)
            .await
    }

    /// Drive a task until it is terminal or parked awaiting user input.
    pub async fn run_task(&self, task_id: TaskId) -> Result<RunReport, EngineError> {
        self.dispatcher.run(task_id).await
    }

    /// The task aggregate: identity, template snapshot, projected state.
    pub async fn get_task(
        &self,
        tenant: &TenantId,
        task_id: TaskId,
    ) -> Result<TaskContext, EngineError> {
        let scoped = self.scoped(tenant);
        scoped.task_record(task_id).await.map_err(EngineError::from)?;
        TaskContext::load(self.store.as_ref(), task_id)
            .await
            .map_err(EngineError::from)
    }

    /// Events of a tenant-owned task, optionally only past `since`.
    pub async fn list_events(
        &self,
        tenant: &TenantId,
        task_id: TaskId,
        since: Option<u64>,
    ) -> Result<Vec<ContextEntry>, EngineError> {
        let scoped = self.scoped(tenant);
        match since {
            Some(seq) => scoped.list_since(task_id, seq).await,
            None => scoped.list(task_id).await,
        }
        .map_err(EngineError::from)
    }

    /// Record a user's answer to a pending UI request and resume the task
    /// when no further input is outstanding.
    pub async fn submit_ui_response(
        &self,
        tenant: &TenantId,
        actor: Actor,
        task_id: TaskId,
        request_id: &RequestId,
        payload: Value,
    ) -> Result<(), EngineError> {
        let scoped = self.scoped(tenant);
        let writer = scoped.writer(task_id).await.map_err(EngineError::from)?;
        self.rendezvous
            .submit_response(&writer, request_id, payload, actor)
            .await?;

        let context = TaskContext::load(self.store.as_ref(), task_id)
            .await
            .map_err(EngineError::from)?;
        if !context.state.status.is_terminal() && !context.state.has_pending_interactions() {
            match self.dispatcher.run(task_id).await {
                Ok(_) => {}
                // Another driver is already making progress; the response
                // is recorded either way
                Err(EngineError::Busy) => {
                    debug!(task = %task_id, "response recorded while a driver is active");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Cancel a tenant-owned task.
    pub async fn cancel_task(
        &self,
        tenant: &TenantId,
        actor: Actor,
        task_id: TaskId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let scoped = self.scoped(tenant);
        scoped.task_record(task_id).await.map_err(EngineError::from)?;
        self.lifecycle.cancel(task_id, actor, reason).await
    }

    /// Recover every in-flight task after a restart.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        self.lifecycle.recover().await
    }

    /// Direct access to the rendezvous, for callers that block on answers.
    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    fn scoped(&self, tenant: &TenantId) -> TenantScopedStore {
        TenantScopedStore::new(Arc::clone(&self.store), tenant.clone())
    }
}

//! The orchestration dispatcher.
//!
//! Drives a task from `active` to a terminal status: ensures a plan exists,
//! walks the phases in topological order, dispatches subtasks to agents
//! (sequentially, or concurrently inside a `parallel` phase), parks on the
//! rendezvous when an agent needs user input, and routes failures through
//! the LLM recovery advisor under a bounded retry budget.
//!
//! A `run` returns when the task reaches a terminal status *or* when every
//! runnable subtask is parked awaiting user input; resumption is a fresh
//! `run` (typically triggered by a submitted UI response), which re-derives
//! all progress from the event log. Subtask request ids are deterministic in
//! `(task, phase, agent)`, so a crashed-and-recovered dispatch reuses the
//! same idempotency token.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_agent_runtime::AgentRuntime;
use maestro_llm_gateway::{LlmGateway, LlmRequest, RequestMetadata};
use maestro_projection::{project, ProjectedState, TaskContext};
use maestro_registry::AgentRegistry;
use maestro_store_core::{TaskStore, TaskWriter};
use maestro_types::{
    ops, Actor, AgentDefinition, AgentErrorKind, AgentId, AgentRequest, AgentStatus, ContextEntry,
    EngineError, NewEntry, PhasePlan, RequestContext, RequestId, TaskId, TaskStatus, Trigger,
    UiPriority, UiRequest, UiRequestStatus, UiTemplateKind,
};

use crate::config::OrchestrationConfig;
use crate::dependency::topological_order;
use crate::planner::Planner;
use crate::rendezvous::Rendezvous;

/// Summary of one `run` invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Projected status when the run returned.
    pub status: Option<TaskStatus>,
    /// Phases completed during this run.
    pub phases_completed: usize,
    /// Subtasks completed during this run.
    pub subtasks_completed: usize,
}

/// Actions the recovery advisor may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Retry the same agent with the same request id.
    Retry,
    /// Retry with another agent sharing a capability.
    RetryWithAlternativeAgent,
    /// Abandon the phase and continue with the plan.
    SkipPhase,
    /// Fail the whole task.
    FailTask,
    /// Open an urgent interaction asking the user how to proceed.
    EscalateToUser,
}

#[derive(Debug)]
enum SubtaskOutcome {
    Completed,
    Parked,
    Skipped,
    Cancelled,
    Failed { kind: String, message: String },
}

#[derive(Debug)]
enum PhaseOutcome {
    Completed,
    Parked,
    Cancelled,
    TaskFailed(String),
}

enum FailureVerdict {
    Retry,
    SwitchAgent,
    Skip,
    Parked,
    Fail { kind: String, message: String },
}

/// Drives tasks through their execution plans.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<AgentRegistry>,
    runtime: Arc<AgentRuntime>,
    rendezvous: Arc<Rendezvous>,
    gateway: Arc<LlmGateway>,
    planner: Arc<Planner>,
    config: OrchestrationConfig,
    active: DashMap<TaskId, CancellationToken>,
}

impl Dispatcher {
    /// Build a dispatcher. Every collaborator is injected so tests can stub
    /// the gateway and agent handler independently.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<AgentRegistry>,
        runtime: Arc<AgentRuntime>,
        rendezvous: Arc<Rendezvous>,
        gateway: Arc<LlmGateway>,
        planner: Arc<Planner>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            store,
            registry,
            runtime,
            rendezvous,
            gateway,
            planner,
            config,
            active: DashMap::new(),
        }
    }

    /// Drive `task_id` until it is terminal or parked awaiting input.
    pub async fn run(&self, task_id: TaskId) -> Result<RunReport, EngineError> {
        let token = CancellationToken::new();
        match self.active.entry(task_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::Busy),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let result = self.drive(task_id, &token).await;
        self.active.remove(&task_id);
        result
    }

    /// Resume an interrupted task. Progress is re-derived from the log, so
    /// this is the same operation as [`Dispatcher::run`].
    pub async fn resume(&self, task_id: TaskId) -> Result<RunReport, EngineError> {
        self.run(task_id).await
    }

    /// Post a cancellation for `task_id` and stop its driver.
    ///
    /// In-flight subtasks are recorded as `subtask_cancelled` before the
    /// terminal `task_cancelled` entry, so the cancellation event is the
    /// last state-modifying entry on the task.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        actor: Actor,
        reason: &str,
    ) -> Result<(), EngineError> {
        if let Some(entry) = self.active.get(&task_id) {
            info!(task = %task_id, reason, "signalling cancellation to active driver");
            entry.value().cancel();
            return Ok(());
        }

        let writer = TaskWriter::attach(Arc::clone(&self.store), task_id)
            .await
            .map_err(EngineError::from)?;
        self.finalize_cancellation(&writer, actor, reason).await
    }

    async fn finalize_cancellation(
        &self,
        writer: &TaskWriter,
        actor: Actor,
        reason: &str,
    ) -> Result<(), EngineError> {
        let task_id = writer.task_id();
        let events = self.store.list(task_id).await.map_err(EngineError::from)?;
        let state = project(&events);
        if state.status.is_terminal() {
            debug!(task = %task_id, "cancel on terminal task is a no-op");
            return Ok(());
        }

        for (agent_id, request_id) in open_dispatches(&events) {
            self.record_subtask_cancelled(writer, &agent_id, &request_id, reason)
                .await?;
        }
        for pending in state.pending_user_interactions() {
            self.rendezvous
                .cancel(
                    writer,
                    &pending.request_id,
                    "task_cancelled",
                    Actor::system("dispatcher"),
                )
                .await?;
        }

        let entry = NewEntry::new(
            actor,
            ops::TASK_CANCELLED,
            json!({ "reason": reason }),
            Trigger::user("cancel_task"),
        )?
        .with_reasoning(format!("task cancelled: {reason}"));
        writer.append(entry).await.map_err(EngineError::from)?;
        info!(task = %task_id, reason, "task cancelled");
        Ok(())
    }

    async fn drive(
        &self,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();

        let context = TaskContext::load(self.store.as_ref(), task_id)
            .await
            .map_err(EngineError::from)?;
        if context.state.status.is_terminal() {
            report.status = Some(context.state.status);
            return Ok(report);
        }

        let writer = TaskWriter::attach(Arc::clone(&self.store), task_id)
            .await
            .map_err(EngineError::from)?;

        // 1. Ensure a plan exists
        let plan = match context.state.plan.clone() {
            Some(plan) => plan,
            None => {
                let planned = tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    planned = self.planner.plan(&context, &writer) => planned,
                };
                match planned {
                    Ok(plan) => plan,
                    Err(EngineError::Cancelled) => {
                        self.finalize_cancellation(&writer, Actor::system("dispatcher"), "cancelled during planning")
                            .await?;
                        report.status = Some(TaskStatus::Cancelled);
                        return Ok(report);
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        // 2. Topological execution order
        let order = topological_order(&plan).map_err(EngineError::Validation)?;

        // 3. Drive phases
        for phase_id in order {
            if cancel.is_cancelled() {
                self.finalize_cancellation(&writer, Actor::system("dispatcher"), "cancelled by caller")
                    .await?;
                report.status = Some(TaskStatus::Cancelled);
                return Ok(report);
            }

            let context = TaskContext::load(self.store.as_ref(), task_id)
                .await
                .map_err(EngineError::from)?;
            if context.state.status.is_terminal() {
                report.status = Some(context.state.status);
                return Ok(report);
            }
            if context.state.completed_phases.contains(&phase_id) {
                continue;
            }

            let phase = plan
                .phase(&phase_id)
                .ok_or_else(|| EngineError::Validation(format!("plan lost phase {phase_id}")))?
                .clone();

            match self
                .run_phase(task_id, &writer, &phase, cancel, &mut report)
                .await?
            {
                PhaseOutcome::Completed => {}
                PhaseOutcome::Parked => {
                    let state = self.projected(task_id).await?;
                    info!(task = %task_id, phase = %phase_id, "run parked awaiting user input");
                    report.status = Some(state.status);
                    return Ok(report);
                }
                PhaseOutcome::Cancelled => {
                    self.finalize_cancellation(&writer, Actor::system("dispatcher"), "cancelled by caller")
                        .await?;
                    report.status = Some(TaskStatus::Cancelled);
                    return Ok(report);
                }
                PhaseOutcome::TaskFailed(reason) => {
                    let entry = NewEntry::new(
                        Actor::system("dispatcher"),
                        ops::TASK_FAILED,
                        json!({ "reason": reason, "phase": phase_id }),
                        Trigger::system("dispatcher"),
                    )?
                    .with_reasoning(format!("phase {phase_id} failed: {reason}"));
                    writer.append(entry).await.map_err(EngineError::from)?;
                    report.status = Some(TaskStatus::Failed);
                    return Ok(report);
                }
            }
        }

        // 4. All phases complete
        let entry = NewEntry::new(
            Actor::system("dispatcher"),
            ops::TASK_COMPLETED,
            json!({}),
            Trigger::system("dispatcher"),
        )?
        .with_reasoning("all plan phases completed");
        writer.append(entry).await.map_err(EngineError::from)?;
        info!(task = %task_id, "task completed");
        report.status = Some(TaskStatus::Completed);
        Ok(report)
    }

    async fn run_phase(
        &self,
        task_id: TaskId,
        writer: &TaskWriter,
        phase: &PhasePlan,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<PhaseOutcome, EngineError> {
        let events = self.store.list(task_id).await.map_err(EngineError::from)?;
        if !phase_started(&events, &phase.phase_id.0) {
            let entry = NewEntry::new(
                Actor::system("dispatcher"),
                ops::PHASE_STARTED,
                json!({ "phase": phase.phase_id }),
                Trigger::system("dispatcher"),
            )?
            .with_reasoning(format!("starting phase {}", phase.name));
            writer.append(entry).await.map_err(EngineError::from)?;
        }

        // Select agents; a plan-named agent missing from the registry fails
        // the phase outright
        let mut definitions = Vec::new();
        for agent_id in &phase.required_agents {
            match self.registry.get(agent_id) {
                Some(definition) => definitions.push(definition),
                None => {
                    warn!(task = %task_id, agent = %agent_id, "required agent not registered");
                    return Ok(PhaseOutcome::TaskFailed(format!(
                        "no_agents_available: {agent_id}"
                    )));
                }
            }
        }

        let outcomes: Vec<Result<SubtaskOutcome, EngineError>> = if phase.parallel {
            futures::future::join_all(
                definitions
                    .iter()
                    .map(|def| self.run_subtask(task_id, writer, phase, def, cancel)),
            )
            .await
        } else {
            let mut collected = Vec::with_capacity(definitions.len());
            for definition in &definitions {
                let outcome = self
                    .run_subtask(task_id, writer, phase, definition, cancel)
                    .await;
                let skip = matches!(outcome, Ok(SubtaskOutcome::Skipped));
                collected.push(outcome);
                if skip {
                    break;
                }
            }
            collected
        };

        let mut parked = false;
        let mut skipped = false;
        for outcome in outcomes {
            match outcome? {
                SubtaskOutcome::Completed => report.subtasks_completed += 1,
                SubtaskOutcome::Parked => parked = true,
                SubtaskOutcome::Skipped => skipped = true,
                SubtaskOutcome::Cancelled => return Ok(PhaseOutcome::Cancelled),
                SubtaskOutcome::Failed { kind, message } => {
                    return Ok(PhaseOutcome::TaskFailed(format!("{kind}: {message}")))
                }
            }
        }

        if parked {
            return Ok(PhaseOutcome::Parked);
        }

        let entry = NewEntry::new(
            Actor::system("dispatcher"),
            ops::PHASE_COMPLETED,
            json!({ "phase": phase.phase_id, "skipped": skipped }),
            Trigger::system("dispatcher"),
        )?
        .with_reasoning(if skipped {
            format!("phase {} skipped by failure policy", phase.name)
        } else {
            format!("phase {} completed", phase.name)
        });
        writer.append(entry).await.map_err(EngineError::from)?;
        report.phases_completed += 1;
        Ok(PhaseOutcome::Completed)
    }

    async fn run_subtask(
        &self,
        task_id: TaskId,
        writer: &TaskWriter,
        phase: &PhasePlan,
        definition: &AgentDefinition,
        cancel: &CancellationToken,
    ) -> Result<SubtaskOutcome, EngineError> {
        let mut current = definition.clone();
        let mut request_id = subtask_request_id(task_id, phase, &current.agent_id);
        let mut attempts: u32 = 0;
        let mut delegations: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.record_subtask_cancelled(writer, &current.agent_id, &request_id, "task cancellation")
                    .await?;
                return Ok(SubtaskOutcome::Cancelled);
            }

            let events = self.store.list(task_id).await.map_err(EngineError::from)?;
            let state = project(&events);

            // Resume path: this subtask already reached its terminal event
            if subtask_completed(&events, &request_id) {
                return Ok(SubtaskOutcome::Completed);
            }

            // An answered escalation decides the subtask's fate
            if let Some(choice) = escalation_choice(&state, &request_id) {
                if choice == "abort" {
                    self.record_subtask_failed(
                        writer,
                        &current.agent_id,
                        &request_id,
                        "escalation_declined",
                        "user declined to retry after failure",
                    )
                    .await?;
                    return Ok(SubtaskOutcome::Failed {
                        kind: "escalation_declined".into(),
                        message: "user declined to retry".into(),
                    });
                }
            }

            // Unanswered questions from this agent keep the subtask parked
            if state
                .pending_user_interactions()
                .any(|r| r.originating_agent_id == current.agent_id)
            {
                return Ok(SubtaskOutcome::Parked);
            }

            let rounds = needs_input_rounds(&events, &request_id);
            if rounds > self.config.max_needs_input_rounds {
                self.record_subtask_failed(
                    writer,
                    &current.agent_id,
                    &request_id,
                    "needs_input_rounds_exhausted",
                    "agent kept requesting input past the configured bound",
                )
                .await?;
                return Ok(SubtaskOutcome::Failed {
                    kind: "needs_input_rounds_exhausted".into(),
                    message: format!("{rounds} needs-input rounds"),
                });
            }

            // One dispatch record per idempotency token; a crash-recovered
            // open dispatch is not re-recorded
            if !has_open_dispatch(&events, &request_id) {
                let entry = NewEntry::new(
                    Actor::system("dispatcher"),
                    ops::SUBTASK_DISPATCHED,
                    json!({
                        "agent_id": current.agent_id,
                        "request_id": request_id,
                        "instruction": phase.name,
                        "phase": phase.phase_id,
                    }),
                    Trigger::system("dispatcher"),
                )?
                .with_reasoning(format!(
                    "dispatching {} to {}",
                    phase.name, current.agent_id
                ));
                writer.append(entry).await.map_err(EngineError::from)?;
            }

            let context = TaskContext::load(self.store.as_ref(), task_id)
                .await
                .map_err(EngineError::from)?;
            let snapshot = context.snapshot();
            let request = AgentRequest {
                request_id: request_id.clone(),
                instruction: phase.name.clone(),
                data: json!({
                    "phase": phase.phase_id,
                    "description": phase.description,
                    "goals": phase.goals,
                }),
                context: RequestContext {
                    urgency: UiPriority::Medium,
                    device_type: None,
                    user_progress: snapshot.completeness,
                    subtask_description: phase.description.clone(),
                    expected_output: "structured task data".into(),
                    success_criteria: phase.goals.clone(),
                },
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                executed = self.runtime.execute(&current, request, &snapshot, writer) => executed,
            };

            let verdict = match result {
                Ok(response) => match response.status {
                    AgentStatus::Completed => {
                        let entry = NewEntry::new(
                            Actor::agent(&current.agent_id, current.version.clone()),
                            ops::SUBTASK_COMPLETED,
                            json!({
                                "agent_id": current.agent_id,
                                "request_id": request_id,
                                "data": response.data,
                                "confidence": response.confidence,
                            }),
                            Trigger::agent("dispatcher"),
                        )?
                        .with_reasoning(
                            response
                                .reasoning
                                .unwrap_or_else(|| "subtask completed".into()),
                        );
                        writer.append(entry).await.map_err(EngineError::from)?;
                        return Ok(SubtaskOutcome::Completed);
                    }
                    // The runtime already opened the UI requests; the next
                    // loop iteration observes them pending and parks
                    AgentStatus::NeedsInput => continue,
                    AgentStatus::Delegated => {
                        delegations += 1;
                        if delegations > self.config.max_delegation_depth {
                            self.record_subtask_failed(
                                writer,
                                &current.agent_id,
                                &request_id,
                                "delegation_depth_exhausted",
                                "too many delegation hops",
                            )
                            .await?;
                            return Ok(SubtaskOutcome::Failed {
                                kind: "delegation_depth_exhausted".into(),
                                message: format!("{delegations} hops"),
                            });
                        }
                        match response.next_agent {
                            Some(next) => match self.registry.get(&next) {
                                Some(next_def) => {
                                    info!(
                                        task = %task_id,
                                        from = %current.agent_id,
                                        to = %next_def.agent_id,
                                        "subtask delegated"
                                    );
                                    current = next_def;
                                    request_id =
                                        subtask_request_id(task_id, phase, &current.agent_id);
                                    continue;
                                }
                                None => {
                                    let err = EngineError::NotFound(format!("agent {next}"));
                                    self.handle_failure(
                                        writer, phase, &mut current, &mut request_id, &mut attempts, task_id, &err,
                                    )
                                    .await?
                                }
                            },
                            None => {
                                let err = EngineError::ContractViolation(
                                    "delegated response without next_agent".into(),
                                );
                                self.handle_failure(
                                    writer, phase, &mut current, &mut request_id, &mut attempts, task_id, &err,
                                )
                                .await?
                            }
                        }
                    }
                    AgentStatus::Error => {
                        let err = envelope_error(&response.error);
                        self.handle_failure(
                            writer, phase, &mut current, &mut request_id, &mut attempts, task_id, &err,
                        )
                        .await?
                    }
                },
                Err(EngineError::Cancelled) => {
                    self.record_subtask_cancelled(writer, &current.agent_id, &request_id, "task cancellation")
                        .await?;
                    return Ok(SubtaskOutcome::Cancelled);
                }
                Err(err) => {
                    self.handle_failure(
                        writer, phase, &mut current, &mut request_id, &mut attempts, task_id, &err,
                    )
                    .await?
                }
            };

            match verdict {
                FailureVerdict::Retry | FailureVerdict::SwitchAgent => continue,
                FailureVerdict::Parked => return Ok(SubtaskOutcome::Parked),
                FailureVerdict::Skip => {
                    self.record_subtask_cancelled(
                        writer,
                        &current.agent_id,
                        &request_id,
                        "phase skipped by failure policy",
                    )
                    .await?;
                    return Ok(SubtaskOutcome::Skipped);
                }
                FailureVerdict::Fail { kind, message } => {
                    return Ok(SubtaskOutcome::Failed { kind, message })
                }
            }
        }
    }

    /// Route one failure through the recovery policy.
    async fn handle_failure(
        &self,
        writer: &TaskWriter,
        phase: &PhasePlan,
        current: &mut AgentDefinition,
        request_id: &mut RequestId,
        attempts: &mut u32,
        task_id: TaskId,
        err: &EngineError,
    ) -> Result<FailureVerdict, EngineError> {
        *attempts += 1;
        let retryable = err.is_retryable();
        let budget_left = *attempts <= self.config.max_subtask_retries;

        warn!(
            task = %task_id,
            agent = %current.agent_id,
            attempt = *attempts,
            kind = err.kind(),
            retryable,
            "subtask failure"
        );

        let advised = self.advise(task_id, current, err).await;
        let action = if !retryable || !budget_left {
            // Structural failures and exhausted budgets only escalate or fail
            match advised {
                RecoveryAction::EscalateToUser => RecoveryAction::EscalateToUser,
                _ => RecoveryAction::FailTask,
            }
        } else {
            advised
        };

        match action {
            RecoveryAction::Retry => {
                tokio::time::sleep(self.jittered_backoff(*attempts)).await;
                Ok(FailureVerdict::Retry)
            }
            RecoveryAction::RetryWithAlternativeAgent => {
                match self.alternative_agent(current) {
                    Some(alternative) => {
                        info!(
                            task = %task_id,
                            from = %current.agent_id,
                            to = %alternative.agent_id,
                            "retrying with alternative agent"
                        );
                        *current = alternative;
                        *request_id = subtask_request_id(task_id, phase, &current.agent_id);
                        Ok(FailureVerdict::SwitchAgent)
                    }
                    None => {
                        self.record_subtask_failed(
                            writer,
                            &current.agent_id,
                            request_id,
                            err.kind(),
                            &format!("{err}; no alternative agent available"),
                        )
                        .await?;
                        Ok(FailureVerdict::Fail {
                            kind: err.kind().into(),
                            message: format!("{err}; no alternative agent"),
                        })
                    }
                }
            }
            RecoveryAction::SkipPhase => Ok(FailureVerdict::Skip),
            RecoveryAction::FailTask => {
                self.record_subtask_failed(
                    writer,
                    &current.agent_id,
                    request_id,
                    err.kind(),
                    &err.to_string(),
                )
                .await?;
                Ok(FailureVerdict::Fail {
                    kind: err.kind().into(),
                    message: err.to_string(),
                })
            }
            RecoveryAction::EscalateToUser => {
                let escalation_id = RequestId(format!("esc-{}-{}", request_id.0, *attempts));
                let ui_request = UiRequest {
                    request_id: escalation_id,
                    template_kind: UiTemplateKind::Confirmation,
                    semantic_data: json!({
                        "data_path": format!("escalations.{}", request_id.0),
                        "prompt": format!(
                            "Agent {} failed during phase {}: {}. Retry or abort?",
                            current.agent_id, phase.name, err
                        ),
                        "options": ["retry", "abort"],
                        "error_kind": err.kind(),
                    }),
                    priority: UiPriority::Urgent,
                    created_at: chrono::Utc::now(),
                    status: UiRequestStatus::Pending,
                    originating_event_id: maestro_types::EntryId::random(),
                    originating_agent_id: current.agent_id.clone(),
                };
                self.rendezvous
                    .open(writer, ui_request, Actor::system("dispatcher"))
                    .await?;
                Ok(FailureVerdict::Parked)
            }
        }
    }

    /// Ask the LLM recovery advisor what to do about a failure. Falls back
    /// to a local heuristic when the advisor itself is unavailable.
    async fn advise(
        &self,
        task_id: TaskId,
        agent: &AgentDefinition,
        err: &EngineError,
    ) -> RecoveryAction {
        let fallback = if err.is_retryable() {
            RecoveryAction::Retry
        } else {
            RecoveryAction::FailTask
        };

        let prompt = format!(
            "A subtask failed inside a task orchestration engine.\n\
             Agent: {} (v{}, role: {})\nFailure kind: {}\nFailure detail: {}\n\n\
             Choose exactly one recovery action and reply as \
             {{\"action\": \"retry|retry_with_alternative_agent|skip_phase|fail_task|escalate_to_user\"}}.",
            agent.agent_id, agent.version, agent.role, err.kind(), err
        );
        let request = match LlmRequest::new(prompt) {
            Ok(request) => request.with_metadata(RequestMetadata {
                task_id: Some(task_id),
                agent_id: Some(agent.agent_id.clone()),
                request_id: RequestId::random(),
                purpose: "recovery_advice".to_string(),
            }),
            Err(_) => return fallback,
        };

        match self.gateway.complete_structured(request).await {
            Ok((value, _)) => value
                .get("action")
                .and_then(|a| serde_json::from_value::<RecoveryAction>(a.clone()).ok())
                .unwrap_or(fallback),
            Err(advisor_err) => {
                debug!(error = %advisor_err, "recovery advisor unavailable, using heuristic");
                fallback
            }
        }
    }

    /// The best other agent sharing a capability with `failed`, preferring
    /// the highest declared version, then the lexicographically smallest id.
    fn alternative_agent(&self, failed: &AgentDefinition) -> Option<AgentDefinition> {
        let mut candidates: Vec<AgentDefinition> = failed
            .capabilities
            .iter()
            .flat_map(|cap| self.registry.find_by_capability(cap))
            .filter(|def| def.agent_id != failed.agent_id)
            .collect();
        candidates.sort_by(|a, b| {
            compare_versions(&b.version, &a.version).then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        candidates.dedup_by(|a, b| a.agent_id == b.agent_id);
        candidates.into_iter().next()
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = rand::thread_rng().gen_range(0..base.max(1) / 2 + 1);
        Duration::from_millis(base + jitter)
    }

    async fn projected(&self, task_id: TaskId) -> Result<ProjectedState, EngineError> {
        let events = self.store.list(task_id).await.map_err(EngineError::from)?;
        Ok(project(&events))
    }

    async fn record_subtask_failed(
        &self,
        writer: &TaskWriter,
        agent_id: &AgentId,
        request_id: &RequestId,
        kind: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        let entry = NewEntry::new(
            Actor::system("dispatcher"),
            ops::SUBTASK_FAILED,
            json!({
                "agent_id": agent_id,
                "request_id": request_id,
                "error_kind": kind,
                "message": message,
            }),
            Trigger::system("dispatcher"),
        )?
        .with_reasoning(format!("subtask failed ({kind}): {message}"));
        writer.append(entry).await.map_err(EngineError::from)?;
        Ok(())
    }

    async fn record_subtask_cancelled(
        &self,
        writer: &TaskWriter,
        agent_id: &AgentId,
        request_id: &RequestId,
        reason: &str,
    ) -> Result<(), EngineError> {
        // Only in-flight dispatches get a cancellation record
        let events = self
            .store
            .list(writer.task_id())
            .await
            .map_err(EngineError::from)?;
        if !has_open_dispatch(&events, request_id) {
            return Ok(());
        }
        let entry = NewEntry::new(
            Actor::system("dispatcher"),
            ops::SUBTASK_CANCELLED,
            json!({
                "agent_id": agent_id,
                "request_id": request_id,
                "reason": reason,
            }),
            Trigger::system("dispatcher"),
        )?
        .with_reasoning(format!("subtask cancelled: {reason}"));
        writer.append(entry).await.map_err(EngineError::from)?;
        Ok(())
    }
}

//─────────────────────────────
//  Event-scan helpers
//─────────────────────────────

/// Deterministic idempotency token for a `(task, phase, agent)` subtask.
pub fn subtask_request_id(task_id: TaskId, phase: &PhasePlan, agent_id: &AgentId) -> RequestId {
    RequestId(format!("{task_id}:{}:{agent_id}", phase.phase_id))
}

fn phase_started(events: &[ContextEntry], phase: &str) -> bool {
    events.iter().any(|e| {
        e.operation == ops::PHASE_STARTED
            && e.data.get("phase").and_then(Value::as_str) == Some(phase)
    })
}

fn matches_request(entry: &ContextEntry, request_id: &RequestId) -> bool {
    entry.data.get("request_id").and_then(Value::as_str) == Some(request_id.0.as_str())
}

fn subtask_completed(events: &[ContextEntry], request_id: &RequestId) -> bool {
    events
        .iter()
        .any(|e| e.operation == ops::SUBTASK_COMPLETED && matches_request(e, request_id))
}

/// Whether a `subtask_dispatched` exists with no later terminal record.
fn has_open_dispatch(events: &[ContextEntry], request_id: &RequestId) -> bool {
    let mut open = false;
    for entry in events {
        if !matches_request(entry, request_id) {
            continue;
        }
        match entry.operation.as_str() {
            ops::SUBTASK_DISPATCHED => open = true,
            ops::SUBTASK_COMPLETED | ops::SUBTASK_FAILED | ops::SUBTASK_CANCELLED => open = false,
            _ => {}
        }
    }
    open
}

/// Open `(agent, request)` pairs across the whole task.
fn open_dispatches(events: &[ContextEntry]) -> Vec<(AgentId, RequestId)> {
    let mut dispatched: Vec<(AgentId, RequestId)> = Vec::new();
    for entry in events {
        let (Some(agent), Some(request)) = (
            entry.data.get("agent_id").and_then(Value::as_str),
            entry.data.get("request_id").and_then(Value::as_str),
        ) else {
            continue;
        };
        let pair = (AgentId(agent.into()), RequestId(request.into()));
        match entry.operation.as_str() {
            ops::SUBTASK_DISPATCHED => {
                if !dispatched.contains(&pair) {
                    dispatched.push(pair);
                }
            }
            ops::SUBTASK_COMPLETED | ops::SUBTASK_FAILED | ops::SUBTASK_CANCELLED => {
                dispatched.retain(|p| p != &pair);
            }
            _ => {}
        }
    }
    dispatched
}

fn needs_input_rounds(events: &[ContextEntry], request_id: &RequestId) -> u32 {
    events
        .iter()
        .filter(|e| {
            e.operation == ops::AGENT_DECISION
                && matches_request(e, request_id)
                && e.data.get("status").and_then(Value::as_str) == Some("needs_input")
        })
        .count() as u32
}

/// The user's `choice` for an escalation of `request_id`, if answered.
fn escalation_choice(state: &ProjectedState, request_id: &RequestId) -> Option<String> {
    // Only honour a choice while no escalation is pending; a newer pending
    // escalation supersedes any earlier answer
    let has_pending_escalation = state
        .pending_user_interactions()
        .any(|r| r.request_id.0.starts_with(&format!("esc-{}-", request_id.0)));
    if has_pending_escalation {
        return None;
    }
    state
        .data
        .get("escalations")?
        .get(&request_id.0)?
        .get("choice")?
        .as_str()
        .map(str::to_owned)
}

fn envelope_error(error: &Option<maestro_types::AgentError>) -> EngineError {
    match error {
        Some(err) => match err.kind {
            AgentErrorKind::UnknownInstruction => {
                EngineError::UnknownInstruction(err.message.clone())
            }
            AgentErrorKind::ContractViolation => {
                EngineError::ContractViolation(err.message.clone())
            }
            AgentErrorKind::CallFailed => EngineError::CallFailed(err.message.clone()),
            AgentErrorKind::Other => EngineError::CallFailed(err.message.clone()),
        },
        None => EngineError::CallFailed("agent reported an error without detail".into()),
    }
}

/// Compare dotted version strings numerically; non-numeric versions fall
/// back to plain string order.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.')
            .map(|part| part.trim_start_matches('v').parse().ok())
            .collect()
    };
    match (parse(a), parse(b)) {
        (Some(left), Some(right)) => {
            let len = left.len().max(right.len());
            for i in 0..len {
                let l = left.get(i).copied().unwrap_or(0);
                let r = right.get(i).copied().unwrap_or(0);
                match l.cmp(&r) {
                    std::cmp::Ordering::Equal => continue,
                    other => return other,
                }
            }
            std::cmp::Ordering::Equal
        }
        _ => a.cmp(b),
    }
}

//! Engine-wide error taxonomy.
//!
//! Every failure mode that crosses a component boundary is one of these
//! kinds. Transient kinds are absorbed by retry machinery; structural kinds
//! surface immediately as task events and may escalate to the user.

use crate::{RequestId, TaskId};

/// The engine-wide error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input failed schema or structural validation. Caller-visible,
    /// non-retryable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An agent received an instruction it does not declare. Non-retryable.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),

    /// An agent response violates its declared output schema. Non-retryable.
    #[error("agent response violates contract: {0}")]
    ContractViolation(String),

    /// Transient LLM or tool failure. Retried with backoff.
    #[error("call failed: {0}")]
    CallFailed(String),

    /// Model output could not be parsed into the expected shape.
    #[error("could not parse model output: {0}")]
    ParseFailed(String),

    /// Provider throttling. Retried with longer backoff.
    #[error("provider rate limited")]
    RateLimited,

    /// A local concurrency cap refused new work. Retried with jittered
    /// backoff.
    #[error("busy: concurrency cap exceeded")]
    Busy,

    /// Optimistic-concurrency conflict on the event log. The caller reloads
    /// the tail and retries.
    #[error("concurrent write on task {task}: expected tail {expected}, found {actual}")]
    ConcurrentWrite {
        /// Task whose log rejected the append.
        task: TaskId,
        /// Tail sequence the writer observed.
        expected: u64,
        /// Tail sequence actually present.
        actual: u64,
    },

    /// Duplicate submission for a UI request that was already answered.
    #[error("ui request {0} already responded")]
    AlreadyResponded(RequestId),

    /// Missing task, request, agent, or template.
    #[error("not found: {0}")]
    NotFound(String),

    /// A suspension point exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Cancellation was signalled for the affected work.
    #[error("cancelled")]
    Cancelled,

    /// A task was too old to recover at startup.
    #[error("task too old to recover")]
    RecoveryTimeout,

    /// The backing store failed in a way that is not a write conflict.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether the dispatcher's retry machinery may absorb this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CallFailed(_) | Self::RateLimited | Self::Busy | Self::ConcurrentWrite { .. }
        )
    }

    /// Short machine-readable kind tag, recorded in failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UnknownInstruction(_) => "unknown_instruction",
            Self::ContractViolation(_) => "contract_violation",
            Self::CallFailed(_) => "call_failed",
            Self::ParseFailed(_) => "parse_failed",
            Self::RateLimited => "rate_limited",
            Self::Busy => "busy",
            Self::ConcurrentWrite { .. } => "concurrent_write",
            Self::AlreadyResponded(_) => "already_responded",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::RecoveryTimeout => "recovery_timeout",
            Self::Storage(_) => "storage_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_retryability() {
        assert!(EngineError::CallFailed("503".into()).is_retryable());
        assert!(EngineError::RateLimited.is_retryable());
        assert!(EngineError::Busy.is_retryable());
        assert!(EngineError::ConcurrentWrite {
            task: TaskId(Uuid::nil()),
            expected: 3,
            actual: 4
        }
        .is_retryable());

        assert!(!EngineError::UnknownInstruction("collect".into()).is_retryable());
        assert!(!EngineError::ContractViolation("missing field".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            EngineError::AlreadyResponded(RequestId("r1".into())).kind(),
            "already_responded"
        );
        assert_eq!(EngineError::RecoveryTimeout.kind(), "recovery_timeout");
    }
}

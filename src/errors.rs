//! Typed error hierarchy for the orchestration engine.
//!
//! Three enums cover the three failure surfaces:
//! - `ExecutionError` — single-task integration failures (transient,
//!   not-configured, precondition, provider)
//! - `RepositoryError` — storage contract failures, including the
//!   duplicate-key signal idempotent creation relies on
//! - `EngineError` — coordinator, scheduler, and facade failures

use thiserror::Error;
use uuid::Uuid;

use crate::model::{ExecutionErrorKind, ReleaseId, ReleaseStage, TaskStatus};

/// Failure of one task execution against its integration.
///
/// These never propagate across task boundaries: the executor records
/// them on the failing task and moves on.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("integration call failed: {message}")]
    Transient { message: String },

    #[error("{integration} integration is not configured")]
    NotConfigured { integration: &'static str },

    #[error("task precondition not met: {0}")]
    Precondition(String),

    #[error("{integration} provider reported failure: {message}")]
    Provider {
        integration: &'static str,
        message: String,
    },
}

impl ExecutionError {
    /// Taxonomy kind persisted into the failed task's output payload.
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            Self::Transient { .. } => ExecutionErrorKind::Transient,
            Self::NotConfigured { .. } => ExecutionErrorKind::NotConfigured,
            Self::Precondition(_) => ExecutionErrorKind::Precondition,
            Self::Provider { .. } => ExecutionErrorKind::Provider,
        }
    }
}

/// Failure of a repository operation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A uniqueness guard rejected the write. Idempotent stage-task
    /// creation treats this as "another creator won the race".
    #[error("duplicate record violates constraint {constraint}")]
    Duplicate { constraint: &'static str },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failure of coordinator, scheduler, or facade operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("release {0} not found")]
    ReleaseNotFound(ReleaseId),

    #[error("cron job for release {0} not found")]
    CronJobNotFound(ReleaseId),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("regression cycle {0} not found")]
    CycleNotFound(Uuid),

    #[error("cross-tenant access to {entity} denied")]
    TenantMismatch { entity: &'static str },

    /// Fewer tasks survive than the stage's minimum after a creation
    /// error. Fatal: the tick aborts and an operator must inspect.
    #[error("stage {stage:?} has {found} tasks, expected {expected}; creation left the stage inconsistent")]
    StageCreationInconsistent {
        stage: ReleaseStage,
        found: usize,
        expected: usize,
    },

    #[error("task {task_id} is {status:?}; only failed tasks can be retried")]
    NotRetryable { task_id: Uuid, status: TaskStatus },

    #[error("stage {stage:?} cannot start while {blocker:?} is incomplete")]
    StageNotApprovable {
        stage: ReleaseStage,
        blocker: ReleaseStage,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_kinds_map_to_taxonomy() {
        let transient = ExecutionError::Transient {
            message: "timeout".to_string(),
        };
        assert_eq!(transient.kind(), ExecutionErrorKind::Transient);

        let missing = ExecutionError::NotConfigured {
            integration: "project management",
        };
        assert_eq!(missing.kind(), ExecutionErrorKind::NotConfigured);
        assert!(missing.to_string().contains("not configured"));

        let provider = ExecutionError::Provider {
            integration: "ci",
            message: "build failed".to_string(),
        };
        assert_eq!(provider.kind(), ExecutionErrorKind::Provider);
    }

    #[test]
    fn repository_duplicate_is_matchable() {
        let err = RepositoryError::Duplicate {
            constraint: "release_stage_task_type",
        };
        assert!(matches!(err, RepositoryError::Duplicate { .. }));
    }

    #[test]
    fn engine_error_converts_from_repository_error() {
        let inner = RepositoryError::Backend("connection reset".to_string());
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Repository(_)));
    }

    #[test]
    fn stage_inconsistency_carries_counts() {
        let err = EngineError::StageCreationInconsistent {
            stage: ReleaseStage::Kickoff,
            found: 3,
            expected: 7,
        };
        let message = err.to_string();
        assert!(message.contains('3'));
        assert!(message.contains('7'));
    }
}

//! Typed error hierarchy for the Conveyor engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — durable state load/save failures
//! - `IsolationError` — slot allocation and workspace lifecycle failures
//! - `OrchestratorError` — phase scheduling and retry failures

use conveyor_common::{Phase, WorkflowId};
use thiserror::Error;

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no workflow record for id '{0}'")]
    NotFound(WorkflowId),

    #[error("workflow record for id '{0}' already exists")]
    AlreadyExists(WorkflowId),

    #[error("workflow record at {path} is corrupt: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A durable write could not complete. Fatal for the current step: state
    /// that was not durably recorded must not be advanced past.
    #[error("failed to persist workflow record at {path}: {source}")]
    Persistence {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the isolation allocator.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("no free isolation slot in a pool of {pool_size}")]
    PoolExhausted { pool_size: usize },

    #[error("failed to provision workspace at {path}: {source}")]
    WorkspaceCreate {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to remove workspace at {path}: {source}")]
    WorkspaceRemove {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write port assignment file at {path}: {source}")]
    PortsFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the orchestration loop and retry controller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("phase {phase} requested before its dependencies succeeded (unmet: {unmet:?})")]
    PreconditionFailed { phase: Phase, unmet: Vec<Phase> },

    #[error("phase {phase} exhausted its {attempts} attempts without success")]
    AttemptsExhausted { phase: Phase, attempts: u32 },

    #[error("executor failed for phase {phase} without producing an outcome: {source}")]
    ExecutorFailed {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::WorkflowId;

    fn wf(id: &str) -> WorkflowId {
        WorkflowId::new(id).unwrap()
    }

    #[test]
    fn store_error_not_found_carries_id() {
        let err = StoreError::NotFound(wf("wf-001"));
        assert!(err.to_string().contains("wf-001"));
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn store_error_persistence_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/tmp/state.json");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::Persistence {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            StoreError::Persistence { path: p, source: s } => {
                assert_eq!(p, &path);
                assert_eq!(s.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Persistence variant"),
        }
    }

    #[test]
    fn isolation_error_pool_exhausted_carries_size() {
        let err = IsolationError::PoolExhausted { pool_size: 15 };
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn orchestrator_error_converts_from_store_error() {
        let inner = StoreError::AlreadyExists(wf("wf-001"));
        let err: OrchestratorError = inner.into();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn orchestrator_error_precondition_lists_unmet_phases() {
        let err = OrchestratorError::PreconditionFailed {
            phase: Phase::Deploy,
            unmet: vec![Phase::Review],
        };
        let msg = err.to_string();
        assert!(msg.contains("deploy"));
        assert!(msg.contains("Review"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound(wf("x")));
        assert_std_error(&IsolationError::PoolExhausted { pool_size: 1 });
        assert_std_error(&OrchestratorError::AttemptsExhausted {
            phase: Phase::UnitTests,
            attempts: 4,
        });
    }
}

//! Capability traits consumed by the orchestration engine.
//!
//! The engine never inspects how a phase does its work or how workspaces
//! are provisioned; it only talks to these two seams. Real implementations
//! live in the `conveyor` crate; tests substitute doubles.

use crate::phase::Phase;
use crate::record::WorkflowRecord;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// What one executor invocation produced.
///
/// `Ok(Outcome)` always consumes an attempt, success or not. Infrastructure
/// failures that produced no outcome are reported as `Err` and do not count
/// against the phase's budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Value>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn success_with(artifacts: BTreeMap<String, Value>) -> Self {
        Self {
            success: true,
            diagnostic: None,
            artifacts,
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
            artifacts: BTreeMap::new(),
        }
    }
}

/// Executes the actual work of one phase.
///
/// `attempt` is 1-based. On retries, `prior_diagnostic` carries the failure
/// detail from the previous attempt so the executor can resolve it.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        record: &WorkflowRecord,
        phase: Phase,
        attempt: u32,
        prior_diagnostic: Option<&str>,
    ) -> Result<Outcome>;
}

/// Provisions and tears down isolated workspaces.
///
/// Removal must be idempotent: removing an absent or half-created workspace
/// is success.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn create_workspace(&self, path: &Path, source_ref: &str) -> Result<()>;

    async fn remove_workspace(&self, path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::WorkflowId;

    struct AlwaysSucceeds;

    #[async_trait]
    impl PhaseExecutor for AlwaysSucceeds {
        async fn execute(
            &self,
            _record: &WorkflowRecord,
            _phase: Phase,
            attempt: u32,
            prior_diagnostic: Option<&str>,
        ) -> Result<Outcome> {
            assert_eq!(attempt, 1);
            assert!(prior_diagnostic.is_none());
            Ok(Outcome::success())
        }
    }

    #[tokio::test]
    async fn test_executor_trait_object_dispatch() {
        let executor: Box<dyn PhaseExecutor> = Box::new(AlwaysSucceeds);
        let record = WorkflowRecord::new(WorkflowId::new("wf-001").unwrap());

        let outcome = executor
            .execute(&record, Phase::Discovery, 1, None)
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = Outcome::success();
        assert!(ok.success);
        assert!(ok.diagnostic.is_none());

        let failed = Outcome::failure("3 tests failing");
        assert!(!failed.success);
        assert_eq!(failed.diagnostic.as_deref(), Some("3 tests failing"));
    }

    #[test]
    fn test_outcome_serde_skips_empty() {
        let json = serde_json::to_string(&Outcome::success()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }
}

//! Durable workflow state: the record, per-phase results, and attempts.
//!
//! A `WorkflowRecord` is the single source of truth for one pipeline run.
//! It is stored as one JSON document and carries a `schema_version` so
//! readers can upgrade older layouts in memory. Fields a reader does not
//! understand are captured in the `extra` map and written back untouched,
//! so records written by a newer version survive a round-trip through an
//! older one.

use crate::id::WorkflowId;
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Default isolation pool capacity (concurrent workflows).
pub const DEFAULT_POOL_CAPACITY: usize = 15;
/// Default base for the primary (backend) port range.
pub const DEFAULT_PRIMARY_PORT_BASE: u16 = 9100;
/// Default base for the secondary (frontend) port range.
pub const DEFAULT_SECONDARY_PORT_BASE: u16 = 9200;

/// Outcome of a single executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One recorded executor attempt for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt index within the phase
    pub index: u32,
    pub outcome: AttemptOutcome,
    /// Failure detail, threaded into the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn success(index: u32) -> Self {
        Self {
            index,
            outcome: AttemptOutcome::Success,
            diagnostic: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(index: u32, diagnostic: Option<String>) -> Self {
        Self {
            index,
            outcome: AttemptOutcome::Failure,
            diagnostic,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Status of a phase within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase has not started (or was explicitly reopened)
    #[default]
    Pending,
    /// Phase is being executed by some orchestrator instance
    Running,
    /// Phase finished successfully
    Succeeded,
    /// Phase exhausted its attempts without success
    Failed,
    /// Phase will never run because a dependency failed
    Skipped,
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Check if the phase completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of one phase attempt sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Logical artifact name -> opaque value, populated only on success
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of attempts recorded before the current attempt sequence
    /// began. Zero until the phase is explicitly reopened after
    /// exhaustion; the retry budget applies to attempts past this mark.
    #[serde(default)]
    pub sequence_base: u32,
}

impl PhaseRecord {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            attempts: Vec::new(),
            artifacts: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            sequence_base: 0,
        }
    }

    /// Attempts recorded in the current attempt sequence (since the last
    /// explicit reopen).
    pub fn attempts_in_sequence(&self) -> u32 {
        self.attempt_count().saturating_sub(self.sequence_base)
    }

    /// Start a fresh attempt sequence without discarding history. The
    /// recorded attempts stay; only the budget window moves.
    pub fn reopen(&mut self) {
        self.sequence_base = self.attempt_count();
        self.status = PhaseStatus::Pending;
        self.finished_at = None;
    }

    /// Number of attempts with a recorded outcome.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// Diagnostic from the most recent failed attempt, if any.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| !a.is_success())
            .and_then(|a| a.diagnostic.as_deref())
    }
}

/// Workspace and port assignment derived from a workflow id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSlot {
    pub workspace_path: PathBuf,
    /// Index into the fixed slot pool
    pub slot_index: usize,
    pub primary_port: u16,
    pub secondary_port: u16,
}

/// The root entity: durable state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub schema_version: u32,
    pub id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationSlot>,
    /// Insertion order is execution order
    #[serde(default)]
    pub phase_results: Vec<PhaseRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Versioned extension map. Unknown fields land here on read and are
    /// written back verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl WorkflowRecord {
    /// Create a fresh record at the current schema version.
    pub fn new(id: WorkflowId) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            id,
            isolation: None,
            phase_results: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Result entry for a phase, if one exists.
    pub fn phase_result(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phase_results.iter().find(|p| p.phase == phase)
    }

    pub fn phase_result_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        self.phase_results.iter_mut().find(|p| p.phase == phase)
    }

    /// Result entry for a phase, created in execution order if absent.
    pub fn ensure_phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        if self.phase_result(phase).is_none() {
            self.phase_results.push(PhaseRecord::new(phase));
        }
        self.phase_result_mut(phase).expect("entry just ensured")
    }

    /// Effective status of a phase; `Pending` when no entry exists yet.
    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phase_result(phase).map(|p| p.status).unwrap_or_default()
    }

    /// Append an attempt under the phase's entry. Attempts are append-only;
    /// a recorded attempt is never rewritten or dropped.
    pub fn record_attempt(&mut self, phase: Phase, attempt: AttemptRecord) {
        self.ensure_phase_mut(phase).attempts.push(attempt);
    }

    /// Upgrade an older on-disk layout in memory.
    ///
    /// Version 1 stored the isolation assignment as flat `workspace_path` /
    /// `backend_port` / `frontend_port` fields; version 2 nests them under
    /// `isolation`. v1 records always used the default port bases, so the
    /// slot index is recoverable from the primary port.
    pub fn upgrade(&mut self) {
        if self.schema_version >= SCHEMA_VERSION {
            return;
        }
        if self.isolation.is_none() {
            let workspace = self
                .extra
                .get("workspace_path")
                .and_then(|v| v.as_str())
                .map(PathBuf::from);
            let primary = self
                .extra
                .get("backend_port")
                .and_then(Self::port_value);
            let secondary = self
                .extra
                .get("frontend_port")
                .and_then(Self::port_value);
            if let (Some(workspace_path), Some(primary_port), Some(secondary_port)) =
                (workspace, primary, secondary)
            {
                let slot_index =
                    primary_port.saturating_sub(DEFAULT_PRIMARY_PORT_BASE) as usize;
                self.isolation = Some(IsolationSlot {
                    workspace_path,
                    slot_index,
                    primary_port,
                    secondary_port,
                });
            }
        }
        self.schema_version = SCHEMA_VERSION;
    }

    /// Mirror the nested isolation fields back to their version-1 names.
    ///
    /// Readers still on the previous schema look for the flat fields; the
    /// mirrors stay for one deprecation cycle.
    pub fn sync_legacy_fields(&mut self) {
        if let Some(slot) = &self.isolation {
            self.extra.insert(
                "workspace_path".to_string(),
                Value::String(slot.workspace_path.display().to_string()),
            );
            self.extra
                .insert("backend_port".to_string(), Value::from(slot.primary_port));
            self.extra
                .insert("frontend_port".to_string(), Value::from(slot.secondary_port));
        }
    }

    /// v1 writers stored ports both as numbers and as env-style strings.
    fn port_value(v: &Value) -> Option<u16> {
        match v {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> WorkflowRecord {
        WorkflowRecord::new(WorkflowId::new(id).unwrap())
    }

    #[test]
    fn test_phase_status_terminal() {
        assert!(!PhaseStatus::Pending.is_terminal());
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Succeeded.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert!(PhaseStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_ensure_phase_preserves_insertion_order() {
        let mut rec = record("wf-001");
        rec.ensure_phase_mut(Phase::Discovery);
        rec.ensure_phase_mut(Phase::Scoping);
        rec.ensure_phase_mut(Phase::Discovery);

        let order: Vec<Phase> = rec.phase_results.iter().map(|p| p.phase).collect();
        assert_eq!(order, vec![Phase::Discovery, Phase::Scoping]);
    }

    #[test]
    fn test_record_attempt_appends() {
        let mut rec = record("wf-001");
        rec.record_attempt(Phase::UnitTests, AttemptRecord::failure(1, Some("boom".into())));
        rec.record_attempt(Phase::UnitTests, AttemptRecord::success(2));

        let pr = rec.phase_result(Phase::UnitTests).unwrap();
        assert_eq!(pr.attempt_count(), 2);
        assert_eq!(pr.attempts[0].index, 1);
        assert!(pr.last_attempt().unwrap().is_success());
        assert_eq!(pr.last_diagnostic(), Some("boom"));
    }

    #[test]
    fn test_serde_roundtrip_identical() {
        let mut rec = record("wf-001");
        rec.isolation = Some(IsolationSlot {
            workspace_path: PathBuf::from("trees/wf-001"),
            slot_index: 10,
            primary_port: 9110,
            secondary_port: 9210,
        });
        rec.record_attempt(Phase::Discovery, AttemptRecord::success(1));
        rec.ensure_phase_mut(Phase::Discovery).status = PhaseStatus::Succeeded;
        rec.extra.insert("note".into(), json!("kept"));

        let json = serde_json::to_string(&rec).unwrap();
        let parsed: WorkflowRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_unknown_fields_are_captured_not_rejected() {
        let doc = json!({
            "schema_version": 3,
            "id": "wf-001",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "future_feature": {"nested": true},
        });
        let rec: WorkflowRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(rec.extra.get("future_feature"), Some(&json!({"nested": true})));

        // And they survive a write.
        let out = serde_json::to_value(&rec).unwrap();
        assert_eq!(out.get("future_feature"), Some(&json!({"nested": true})));
    }

    #[test]
    fn test_upgrade_lifts_v1_flat_isolation() {
        let doc = json!({
            "schema_version": 1,
            "id": "wf-001",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "workspace_path": "trees/wf-001",
            "backend_port": 9110,
            "frontend_port": "9210",
        });
        let mut rec: WorkflowRecord = serde_json::from_value(doc).unwrap();
        assert!(rec.isolation.is_none());

        rec.upgrade();
        assert_eq!(rec.schema_version, SCHEMA_VERSION);
        let slot = rec.isolation.as_ref().unwrap();
        assert_eq!(slot.workspace_path, PathBuf::from("trees/wf-001"));
        assert_eq!(slot.slot_index, 10);
        assert_eq!(slot.primary_port, 9110);
        assert_eq!(slot.secondary_port, 9210);
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let mut rec = record("wf-001");
        rec.isolation = Some(IsolationSlot {
            workspace_path: PathBuf::from("trees/wf-001"),
            slot_index: 10,
            primary_port: 9110,
            secondary_port: 9210,
        });
        let before = rec.clone();
        rec.upgrade();
        assert_eq!(rec, before);
    }

    #[test]
    fn test_reopen_moves_budget_window_keeps_history() {
        let mut rec = record("wf-001");
        for i in 1..=4 {
            rec.record_attempt(Phase::UnitTests, AttemptRecord::failure(i, None));
        }
        let pr = rec.phase_result_mut(Phase::UnitTests).unwrap();
        pr.status = PhaseStatus::Failed;
        assert_eq!(pr.attempts_in_sequence(), 4);

        pr.reopen();
        assert_eq!(pr.status, PhaseStatus::Pending);
        assert_eq!(pr.attempt_count(), 4);
        assert_eq!(pr.sequence_base, 4);
        assert_eq!(pr.attempts_in_sequence(), 0);
    }

    #[test]
    fn test_legacy_mirrors_written_for_old_readers() {
        let mut rec = record("wf-001");
        rec.isolation = Some(IsolationSlot {
            workspace_path: PathBuf::from("trees/wf-001"),
            slot_index: 10,
            primary_port: 9110,
            secondary_port: 9210,
        });
        rec.sync_legacy_fields();

        let doc = serde_json::to_value(&rec).unwrap();
        assert_eq!(doc.get("workspace_path"), Some(&json!("trees/wf-001")));
        assert_eq!(doc.get("backend_port"), Some(&json!(9110)));
        assert_eq!(doc.get("frontend_port"), Some(&json!(9210)));
    }
}

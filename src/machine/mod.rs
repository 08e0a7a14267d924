//! Phase state machine: which phases may run next.
//!
//! The machine owns no state of its own. Every operation is a pure query
//! over a `WorkflowRecord` plus the static dependency table on `Phase`, so
//! two processes looking at the same record reach the same conclusions.
//!
//! A phase left in `running` longer than the staleness threshold is treated
//! as abandoned by a crashed owner and becomes runnable again; that is the
//! crash-recovery path, not an error.

use crate::config::Config;
use chrono::{Duration, Utc};
use conveyor_common::{Phase, PhaseRecord, PhaseStatus, WorkflowRecord};
use tracing::{debug, info};

/// Scheduling queries over a workflow record.
pub struct PhaseMachine {
    stale_after: Duration,
}

impl PhaseMachine {
    pub fn new(stale_running_minutes: i64) -> Self {
        Self {
            stale_after: Duration::minutes(stale_running_minutes),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.stale_running_minutes)
    }

    /// Every phase whose dependencies all succeeded and that is itself
    /// ready to (re)start. Returns more than one phase exactly when the
    /// parallel-eligible group is ready.
    pub fn next_runnable(&self, record: &WorkflowRecord) -> Vec<Phase> {
        Phase::ALL
            .iter()
            .copied()
            .filter(|phase| self.phase_ready(record, *phase))
            .collect()
    }

    /// Dependencies of a phase that have not succeeded.
    pub fn unmet_dependencies(&self, record: &WorkflowRecord, phase: Phase) -> Vec<Phase> {
        phase
            .depends_on()
            .iter()
            .copied()
            .filter(|dep| !record.phase_status(*dep).is_success())
            .collect()
    }

    /// True if the phase can be picked up again without redoing completed
    /// work: it previously failed, or never got past pending.
    pub fn can_resume(&self, record: &WorkflowRecord, phase: Phase) -> bool {
        matches!(
            record.phase_status(phase),
            PhaseStatus::Failed | PhaseStatus::Pending
        )
    }

    /// Mark every phase downstream of a failure as skipped. Returns the
    /// phases newly marked.
    pub fn mark_skipped_dependents(&self, record: &mut WorkflowRecord) -> Vec<Phase> {
        let mut newly_skipped = Vec::new();
        // ALL is topologically ordered, so one pass propagates transitively.
        for phase in Phase::ALL {
            if record.phase_status(phase).is_terminal() {
                continue;
            }
            let blocked = phase.depends_on().iter().any(|dep| {
                matches!(
                    record.phase_status(*dep),
                    PhaseStatus::Failed | PhaseStatus::Skipped
                )
            });
            if blocked {
                record.ensure_phase_mut(phase).status = PhaseStatus::Skipped;
                newly_skipped.push(phase);
            }
        }
        if !newly_skipped.is_empty() {
            info!(skipped = ?newly_skipped, "skipped dependents of a failed phase");
        }
        newly_skipped
    }

    /// All phases succeeded.
    pub fn is_complete(&self, record: &WorkflowRecord) -> bool {
        Phase::ALL
            .iter()
            .all(|p| record.phase_status(*p).is_success())
    }

    /// A phase is actively owned by a live orchestrator.
    pub fn has_active(&self, record: &WorkflowRecord) -> bool {
        record
            .phase_results
            .iter()
            .any(|pr| pr.status == PhaseStatus::Running && !self.is_stale_running(pr))
    }

    /// Nothing runnable, nothing active, not everything succeeded: a failed
    /// dependency chain has halted the workflow.
    pub fn is_halted(&self, record: &WorkflowRecord) -> bool {
        !self.is_complete(record)
            && !self.has_active(record)
            && self.next_runnable(record).is_empty()
    }

    fn phase_ready(&self, record: &WorkflowRecord, phase: Phase) -> bool {
        match record.phase_status(phase) {
            PhaseStatus::Pending => {}
            PhaseStatus::Running => {
                let Some(pr) = record.phase_result(phase) else {
                    return false;
                };
                if !self.is_stale_running(pr) {
                    return false;
                }
                debug!(phase = %phase, "running marker is stale, allowing a fresh attempt");
            }
            // Succeeded, failed after exhaustion, and skipped are terminal
            // for the scheduling loop.
            PhaseStatus::Succeeded | PhaseStatus::Failed | PhaseStatus::Skipped => return false,
        }
        self.unmet_dependencies(record, phase).is_empty()
    }

    /// A `running` marker with no recent heartbeat. A marker without a
    /// start timestamp came from a writer that died before recording one.
    fn is_stale_running(&self, pr: &PhaseRecord) -> bool {
        match pr.started_at {
            Some(started_at) => Utc::now() - started_at > self.stale_after,
            None => true,
        }
    }
}

//! Bounded-attempt retry with failure-diagnostic threading.
//!
//! The controller wraps one phase's executor with that phase's retry
//! budget. The diagnostic from a failed attempt is handed to the next
//! attempt so the executor can resolve the failure instead of repeating it
//! blindly. Every attempt outcome is persisted before the continuation
//! decision, which bounds data loss to at most the in-flight attempt.
//!
//! Budget accounting follows the record, not the process: a crash that
//! persisted no outcome costs nothing, while persisted failures stay spent
//! across restarts.

use crate::errors::OrchestratorError;
use crate::store::FileStore;
use conveyor_common::{
    AttemptRecord, Outcome, Phase, PhaseExecutor, PhaseStatus, WorkflowId,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry budget for one controller run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

/// How a controller run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Phase succeeded within budget
    Succeeded,
    /// Budget consumed without success; recorded on the phase, not raised
    Exhausted { attempts: u32 },
    /// Cooperative cancellation observed between attempts
    Cancelled,
}

/// Drives one phase's attempt sequence against the durable record.
pub struct RetryController {
    store: FileStore,
    id: WorkflowId,
}

impl RetryController {
    pub fn new(store: FileStore, id: WorkflowId) -> Self {
        Self { store, id }
    }

    /// Run the phase until success, exhaustion, or cancellation.
    pub async fn run(
        &self,
        phase: Phase,
        policy: RetryPolicy,
        executor: &dyn PhaseExecutor,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, OrchestratorError> {
        let record = self.store.load(&self.id)?;

        if record.phase_status(phase).is_success() {
            return Ok(RunStatus::Succeeded);
        }

        // Only persisted outcomes consume budget; a crashed attempt that
        // recorded nothing is retried at the same index. After an explicit
        // reopen the budget window starts at `sequence_base`.
        let (recorded, sequence_base) = record
            .phase_result(phase)
            .map(|pr| (pr.attempt_count(), pr.sequence_base))
            .unwrap_or((0, 0));
        let spent = recorded.saturating_sub(sequence_base);
        let mut prior_diagnostic: Option<String> = record
            .phase_result(phase)
            .and_then(|pr| pr.last_diagnostic().map(str::to_string));

        if spent >= policy.max_attempts {
            self.store.update(&self.id, |r| {
                r.ensure_phase_mut(phase).status = PhaseStatus::Failed;
            })?;
            return Ok(RunStatus::Exhausted { attempts: spent });
        }

        self.store.update(&self.id, |r| {
            let pr = r.ensure_phase_mut(phase);
            pr.status = PhaseStatus::Running;
            pr.started_at = Some(Utc::now());
        })?;

        let sequence_end = sequence_base + policy.max_attempts;
        for attempt_index in (recorded + 1)..=sequence_end {
            if cancel.is_cancelled() {
                info!(phase = %phase, "cancelled before attempt {attempt_index}");
                self.store.update(&self.id, |r| {
                    r.ensure_phase_mut(phase).status = PhaseStatus::Pending;
                })?;
                return Ok(RunStatus::Cancelled);
            }

            info!(
                phase = %phase,
                attempt = attempt_index,
                budget = policy.max_attempts,
                "starting attempt"
            );

            let snapshot = self.store.load(&self.id)?;
            let outcome = match executor
                .execute(&snapshot, phase, attempt_index, prior_diagnostic.as_deref())
                .await
            {
                Ok(outcome) => outcome,
                Err(source) => {
                    // No outcome was produced, so no budget is spent; hand
                    // the phase back as pending for a later run.
                    self.store.update(&self.id, |r| {
                        r.ensure_phase_mut(phase).status = PhaseStatus::Pending;
                    })?;
                    return Err(OrchestratorError::ExecutorFailed { phase, source });
                }
            };

            let last_allowed = attempt_index == sequence_end;
            self.persist_attempt(phase, attempt_index, &outcome, last_allowed)?;

            if outcome.success {
                info!(phase = %phase, attempt = attempt_index, "phase succeeded");
                return Ok(RunStatus::Succeeded);
            }

            warn!(
                phase = %phase,
                attempt = attempt_index,
                diagnostic = outcome.diagnostic.as_deref().unwrap_or("<none>"),
                "attempt failed"
            );
            prior_diagnostic = outcome.diagnostic;
        }

        warn!(
            phase = %phase,
            attempts = policy.max_attempts,
            "attempts exhausted without success"
        );
        Ok(RunStatus::Exhausted {
            attempts: policy.max_attempts,
        })
    }

    /// Record one attempt and its consequences in a single durable write.
    fn persist_attempt(
        &self,
        phase: Phase,
        attempt_index: u32,
        outcome: &Outcome,
        last_allowed: bool,
    ) -> Result<(), OrchestratorError> {
        let attempt = if outcome.success {
            AttemptRecord::success(attempt_index)
        } else {
            AttemptRecord::failure(attempt_index, outcome.diagnostic.clone())
        };
        let artifacts = outcome.artifacts.clone();
        let success = outcome.success;

        self.store.update(&self.id, move |r| {
            r.record_attempt(phase, attempt);
            let pr = r.phase_result_mut(phase).expect("entry exists after append");
            if success {
                pr.status = PhaseStatus::Succeeded;
                pr.finished_at = Some(Utc::now());
                pr.artifacts.extend(artifacts);
            } else if last_allowed {
                pr.status = PhaseStatus::Failed;
                pr.finished_at = Some(Utc::now());
            }
        })?;
        Ok(())
    }
}

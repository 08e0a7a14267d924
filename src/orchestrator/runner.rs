//! The driving loop for one workflow.
//!
//! The orchestrator owns no phase logic. It resolves the next runnable
//! phases from the record, acquires isolation once, hands each phase to a
//! retry controller, and persists results as it goes. Parallel-eligible
//! phases run as concurrent tasks with their results joined over a channel;
//! everything else runs inline.
//!
//! One orchestrator instance is the single logical writer for its id while
//! `run` executes. Record mutation goes through the store's per-id lock,
//! which is never held across an executor call, so a long-running phase
//! blocks nothing but itself.

use crate::config::Config;
use crate::errors::{OrchestratorError, StoreError};
use crate::isolation::IsolationAllocator;
use crate::machine::PhaseMachine;
use crate::retry::{RetryController, RetryPolicy, RunStatus};
use crate::store::FileStore;
use conveyor_common::{Phase, PhaseExecutor, PhaseStatus, WorkflowId, WorkflowRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Composes the engine components into a driving loop.
pub struct Orchestrator {
    config: Config,
    store: FileStore,
    allocator: IsolationAllocator,
    machine: PhaseMachine,
    executor: Arc<dyn PhaseExecutor>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: FileStore,
        allocator: IsolationAllocator,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Self {
        let machine = PhaseMachine::from_config(&config);
        Self {
            config,
            store,
            allocator,
            machine,
            executor,
            cancel: CancellationToken::new(),
        }
    }

    /// Token checked before each phase dispatch and each retry attempt.
    /// In-flight attempts are never interrupted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the workflow until nothing is runnable: all phases succeeded,
    /// a failed chain halted its dependents, or cancellation was requested.
    /// Returns the final record.
    pub async fn run(&self, id: &WorkflowId) -> Result<WorkflowRecord, OrchestratorError> {
        let record = self.load_or_create(id)?;
        self.ensure_isolation(id, &record).await?;

        loop {
            if self.cancel.is_cancelled() {
                info!(id = %id, "cancellation requested, stopping dispatch");
                break;
            }

            let record = self.store.load(id)?;
            let runnable = self.machine.next_runnable(&record);

            if runnable.is_empty() {
                break;
            }

            info!(id = %id, phases = ?runnable, "dispatching runnable phases");

            if runnable.len() > 1 && runnable.iter().all(Phase::parallel_eligible) {
                self.run_parallel(id, &runnable).await?;
            } else {
                self.run_phase(id, runnable[0]).await?;
            }
        }

        let record = self.store.load(id)?;
        self.report(&record);
        Ok(record)
    }

    /// Run one specific phase, verifying its preconditions first.
    pub async fn run_single(
        &self,
        id: &WorkflowId,
        phase: Phase,
    ) -> Result<RunStatus, OrchestratorError> {
        let record = self.load_or_create(id)?;
        self.ensure_isolation(id, &record).await?;

        let record = self.store.load(id)?;
        let unmet = self.machine.unmet_dependencies(&record, phase);
        if !unmet.is_empty() {
            return Err(OrchestratorError::PreconditionFailed { phase, unmet });
        }

        let status = self.run_phase(id, phase).await?;
        // Inside the loop exhaustion only halts dependents, but a caller
        // asking for one specific phase gets told directly.
        if let RunStatus::Exhausted { attempts } = status {
            return Err(OrchestratorError::AttemptsExhausted { phase, attempts });
        }
        Ok(status)
    }

    /// Reopen failed phases (and their skipped dependents) for a fresh
    /// attempt sequence. Explicit operator action; the loop itself never
    /// retries an exhausted phase.
    pub fn reopen_failed(&self, id: &WorkflowId) -> Result<WorkflowRecord, OrchestratorError> {
        let machine = &self.machine;
        let record = self.store.update(id, |record| {
            for phase in Phase::ALL {
                match record.phase_status(phase) {
                    PhaseStatus::Failed if machine.can_resume(record, phase) => {
                        record.ensure_phase_mut(phase).reopen();
                    }
                    PhaseStatus::Skipped => {
                        record.ensure_phase_mut(phase).status = PhaseStatus::Pending;
                    }
                    _ => {}
                }
            }
        })?;
        Ok(record)
    }

    fn load_or_create(&self, id: &WorkflowId) -> Result<WorkflowRecord, OrchestratorError> {
        match self.store.load(id) {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => {
                info!(id = %id, "no record found, creating workflow");
                Ok(self.store.create(id)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Assign the isolation slot once and persist it before any phase runs.
    async fn ensure_isolation(
        &self,
        id: &WorkflowId,
        record: &WorkflowRecord,
    ) -> Result<(), OrchestratorError> {
        if record.isolation.is_some() {
            return Ok(());
        }
        let slot = self.allocator.allocate(id).await?;
        self.store.update(id, |record| {
            // Assigned once, immutable thereafter.
            if record.isolation.is_none() {
                record.isolation = Some(slot);
            }
        })?;
        Ok(())
    }

    async fn run_phase(
        &self,
        id: &WorkflowId,
        phase: Phase,
    ) -> Result<RunStatus, OrchestratorError> {
        let controller = RetryController::new(self.store.clone(), id.clone());
        let policy = RetryPolicy::new(self.config.max_attempts_for(phase));
        let status = controller
            .run(phase, policy, self.executor.as_ref(), &self.cancel)
            .await?;
        self.after_phase(id, phase, status)?;
        Ok(status)
    }

    /// Run the parallel-eligible group as concurrent tasks, each with its
    /// own controller, and join every result before continuing.
    async fn run_parallel(
        &self,
        id: &WorkflowId,
        phases: &[Phase],
    ) -> Result<(), OrchestratorError> {
        let (result_tx, mut result_rx) =
            mpsc::channel::<(Phase, Result<RunStatus, OrchestratorError>)>(phases.len());

        for &phase in phases {
            let result_tx = result_tx.clone();
            let store = self.store.clone();
            let id = id.clone();
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let policy = RetryPolicy::new(self.config.max_attempts_for(phase));

            tokio::spawn(async move {
                let controller = RetryController::new(store, id);
                let result = controller
                    .run(phase, policy, executor.as_ref(), &cancel)
                    .await;
                result_tx.send((phase, result)).await.ok();
            });
        }
        drop(result_tx);

        let mut first_error = None;
        while let Some((phase, result)) = result_rx.recv().await {
            match result {
                Ok(status) => self.after_phase(id, phase, status)?,
                Err(e) => {
                    warn!(phase = %phase, error = %e, "parallel phase task failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Post-phase bookkeeping shared by both dispatch paths.
    fn after_phase(
        &self,
        id: &WorkflowId,
        phase: Phase,
        status: RunStatus,
    ) -> Result<(), OrchestratorError> {
        if let RunStatus::Exhausted { attempts } = status {
            warn!(
                id = %id,
                phase = %phase,
                attempts,
                "phase exhausted its attempts, halting dependents"
            );
            let machine = &self.machine;
            self.store.update(id, |record| {
                machine.mark_skipped_dependents(record);
            })?;
        }
        Ok(())
    }

    fn report(&self, record: &WorkflowRecord) {
        if self.machine.is_complete(record) {
            info!(id = %record.id, "workflow complete: all phases succeeded");
        } else if self.machine.is_halted(record) {
            let failed: Vec<Phase> = Phase::ALL
                .iter()
                .copied()
                .filter(|p| record.phase_status(*p) == PhaseStatus::Failed)
                .collect();
            warn!(id = %record.id, failed = ?failed, "workflow halted on failed phases");
        } else {
            info!(id = %record.id, "workflow stopped with phases still pending");
        }
    }
}

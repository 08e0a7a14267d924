//! Shared domain types for the Conveyor pipeline orchestrator.

pub mod executor;
pub mod id;
pub mod phase;
pub mod record;

pub use executor::{Outcome, PhaseExecutor, WorkspaceProvisioner};
pub use id::{IdError, WorkflowId};
pub use phase::Phase;
pub use record::{
    AttemptOutcome, AttemptRecord, IsolationSlot, PhaseRecord, PhaseStatus, WorkflowRecord,
    DEFAULT_POOL_CAPACITY, DEFAULT_PRIMARY_PORT_BASE, DEFAULT_SECONDARY_PORT_BASE, SCHEMA_VERSION,
};

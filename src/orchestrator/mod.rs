//! Workflow orchestration: the loop that composes store, allocator,
//! machine, and retry controller.

pub mod runner;

pub use runner::Orchestrator;

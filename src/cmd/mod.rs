//! CLI command implementations.
//!
//! Thin wrappers over the library: diagnostics read the store directly,
//! `slot` uses the side-effect-free derivation, and `run` wires the real
//! worktree provisioner and agent command into the orchestrator.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;

use conveyor::agent::CommandExecutor;
use conveyor::config::Config;
use conveyor::isolation::worktree::GitWorktree;
use conveyor::isolation::IsolationAllocator;
use conveyor::orchestrator::Orchestrator;
use conveyor::store::FileStore;
use conveyor_common::{Phase, PhaseStatus, WorkflowId, WorkflowRecord};

fn store_for(config: &Config) -> FileStore {
    FileStore::new(config.state_root())
}

fn parse_id(id: &str) -> Result<WorkflowId> {
    WorkflowId::new(id).with_context(|| format!("'{}' is not a valid workflow id", id))
}

pub fn cmd_create(project_dir: &Path, id: Option<&str>) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);

    let id = match id {
        Some(id) => parse_id(id)?,
        None => WorkflowId::generate(),
    };
    store.create(&id)?;

    println!();
    println!("Created workflow {}", style(&id).bold());
    println!("Record: {}", store.record_path(&id).display());
    println!();
    Ok(())
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);
    let ids = store.list()?;

    if ids.is_empty() {
        println!();
        println!("No workflows found. Run 'conveyor create' to start one.");
        println!();
        return Ok(());
    }

    println!();
    println!("{:<12} {:<10} {:<10} Last phase", "Workflow", "Done", "Failed");
    println!("{:<12} {:<10} {:<10} ----------", "--------", "----", "------");
    for id in ids {
        let record = store.load(&id)?;
        let done = count_status(&record, PhaseStatus::Succeeded);
        let failed = count_status(&record, PhaseStatus::Failed);
        let last = record
            .phase_results
            .last()
            .map(|pr| pr.phase.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:<10} {:<10} {}", id, done, failed, last);
    }
    println!();
    Ok(())
}

pub fn cmd_status(project_dir: &Path, id: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);
    let id = parse_id(id)?;
    let record = store.load(&id)?;

    println!();
    println!("Workflow {}", style(&id).bold());
    println!("Schema version: {}", record.schema_version);
    match &record.isolation {
        Some(slot) => println!(
            "Isolation: {} (slot {}, ports {}/{})",
            slot.workspace_path.display(),
            slot.slot_index,
            slot.primary_port,
            slot.secondary_port
        ),
        None => println!("Isolation: not yet assigned"),
    }
    println!();
    println!(
        "{:<18} {:<11} {:<9} Last diagnostic",
        "Phase", "Status", "Attempts"
    );
    println!(
        "{:<18} {:<11} {:<9} ---------------",
        "-----", "------", "--------"
    );

    for phase in Phase::ALL {
        let (status, attempts, diagnostic) = match record.phase_result(phase) {
            Some(pr) => (
                pr.status,
                pr.attempt_count(),
                pr.last_diagnostic().unwrap_or("-").to_string(),
            ),
            None => (PhaseStatus::Pending, 0, "-".to_string()),
        };
        let styled = match status {
            PhaseStatus::Succeeded => style(status.to_string()).green(),
            PhaseStatus::Failed => style(status.to_string()).red(),
            PhaseStatus::Running => style(status.to_string()).yellow(),
            _ => style(status.to_string()).dim(),
        };
        println!(
            "{:<18} {:<11} {:<9} {}",
            phase,
            styled,
            attempts,
            first_line(&diagnostic)
        );
    }
    println!();
    Ok(())
}

/// Show the assignment an id derives to, without touching anything.
pub fn cmd_slot(project_dir: &Path, id: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let id = parse_id(id)?;
    let allocator =
        IsolationAllocator::new(&config, Arc::new(GitWorktree::new(project_dir)));
    let slot = allocator.peek(&id);

    println!();
    println!("Workflow {}", style(&id).bold());
    println!("Derived slot index: {}", slot.slot_index);
    println!("Workspace: {}", slot.workspace_path.display());
    println!("Primary port: {}", slot.primary_port);
    println!("Secondary port: {}", slot.secondary_port);
    println!();
    Ok(())
}

/// Run exactly one phase, after verifying its preconditions.
pub async fn cmd_phase(project_dir: &Path, id: &str, phase: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);
    let id = parse_id(id)?;
    let phase: Phase = phase.parse()?;

    let allocator =
        IsolationAllocator::new(&config, Arc::new(GitWorktree::new(project_dir)));
    let executor = Arc::new(CommandExecutor::new(&config.agent_command));
    let orchestrator = Orchestrator::new(config, store.clone(), allocator, executor);

    orchestrator.run_single(&id, phase).await?;
    let record = store.load(&id)?;
    let pr = record.phase_result(phase).expect("phase just ran");
    println!();
    println!(
        "Phase {} {} after {} attempts",
        style(phase).bold(),
        pr.status,
        pr.attempt_count()
    );
    println!();
    Ok(())
}

pub async fn cmd_run(project_dir: &Path, id: &str, retry_failed: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);
    let id = parse_id(id)?;

    let allocator =
        IsolationAllocator::new(&config, Arc::new(GitWorktree::new(project_dir)));
    let executor = Arc::new(CommandExecutor::new(&config.agent_command));
    let orchestrator = Orchestrator::new(config, store, allocator, executor);

    if retry_failed {
        orchestrator.reopen_failed(&id)?;
    }

    let record = orchestrator.run(&id).await?;
    print_outcome(&record);
    Ok(())
}

pub async fn cmd_release(project_dir: &Path, id: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = store_for(&config);
    let id = parse_id(id)?;

    let allocator =
        IsolationAllocator::new(&config, Arc::new(GitWorktree::new(project_dir)));
    // Use the recorded assignment when there is one; fall back to the
    // derived slot so teardown works even without a record.
    let slot = match store.load(&id) {
        Ok(record) => record.isolation.unwrap_or_else(|| allocator.peek(&id)),
        Err(_) => allocator.peek(&id),
    };
    allocator.release(&slot).await?;

    println!();
    println!("Released workspace {}", slot.workspace_path.display());
    println!();
    Ok(())
}

fn print_outcome(record: &WorkflowRecord) {
    let succeeded = count_status(record, PhaseStatus::Succeeded);
    let failed: Vec<Phase> = Phase::ALL
        .iter()
        .copied()
        .filter(|p| record.phase_status(*p) == PhaseStatus::Failed)
        .collect();

    println!();
    if failed.is_empty() && succeeded == Phase::ALL.len() {
        println!("{}", style("Workflow complete: all phases succeeded").green());
    } else if failed.is_empty() {
        println!("Workflow stopped with {} phases succeeded", succeeded);
    } else {
        println!("{}", style("Workflow halted").red());
        for phase in failed {
            let pr = record.phase_result(phase).expect("failed phase has entry");
            println!(
                "  {} failed after {} attempts: {}",
                phase,
                pr.attempt_count(),
                first_line(pr.last_diagnostic().unwrap_or("-"))
            );
        }
    }
    println!();
}

fn count_status(record: &WorkflowRecord, status: PhaseStatus) -> usize {
    Phase::ALL
        .iter()
        .filter(|p| record.phase_status(**p) == status)
        .count()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("-")
}

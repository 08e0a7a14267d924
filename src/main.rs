use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Automated delivery pipeline orchestrator")]
pub struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new workflow record
    Create {
        /// Workflow id; generated when omitted
        id: Option<String>,
    },
    /// Drive a workflow until nothing is runnable
    Run {
        id: String,
        /// Reopen failed phases for a fresh attempt sequence first
        #[arg(long)]
        retry_failed: bool,
    },
    /// Run a single phase of a workflow
    Phase { id: String, phase: String },
    /// Show a workflow's phase results and isolation assignment
    Status { id: String },
    /// Show the isolation slot an id derives to (no side effects)
    Slot { id: String },
    /// List all workflows with stored records
    List,
    /// Tear down a workflow's isolated workspace
    Release { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CONVEYOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Create { id } => cmd::cmd_create(&project_dir, id.as_deref())?,
        Commands::Run { id, retry_failed } => {
            cmd::cmd_run(&project_dir, id, *retry_failed).await?
        }
        Commands::Phase { id, phase } => cmd::cmd_phase(&project_dir, id, phase).await?,
        Commands::Status { id } => cmd::cmd_status(&project_dir, id)?,
        Commands::Slot { id } => cmd::cmd_slot(&project_dir, id)?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Release { id } => cmd::cmd_release(&project_dir, id).await?,
    }

    Ok(())
}

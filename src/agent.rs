//! Default phase executor: spawn a configured agent command.
//!
//! The engine never looks inside the agent; this adapter gives it the
//! narrowest possible surface. The command receives the phase name as its
//! argument and the workflow context through `CONVEYOR_*` environment
//! variables, runs inside the workflow's isolated workspace, and reports
//! back through its exit status. A JSON object on stdout becomes the
//! phase's artifacts; the stderr tail becomes the failure diagnostic.

use crate::util::{extract_json_object, tail_lines};
use anyhow::{Context, Result};
use async_trait::async_trait;
use conveyor_common::{Outcome, Phase, PhaseExecutor, WorkflowRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// How many trailing output lines to keep as a diagnostic.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Spawns one external command per phase attempt.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Build from a command line like `"claude --print"`.
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl PhaseExecutor for CommandExecutor {
    async fn execute(
        &self,
        record: &WorkflowRecord,
        phase: Phase,
        attempt: u32,
        prior_diagnostic: Option<&str>,
    ) -> Result<Outcome> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(phase.name())
            .env("CONVEYOR_WORKFLOW_ID", record.id.as_str())
            .env("CONVEYOR_PHASE", phase.name())
            .env("CONVEYOR_ATTEMPT", attempt.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(diagnostic) = prior_diagnostic {
            cmd.env("CONVEYOR_PRIOR_DIAGNOSTIC", diagnostic);
        }
        if let Some(slot) = &record.isolation {
            cmd.current_dir(&slot.workspace_path)
                .env("CONVEYOR_WORKSPACE", &slot.workspace_path)
                .env("CONVEYOR_PRIMARY_PORT", slot.primary_port.to_string())
                .env("CONVEYOR_SECONDARY_PORT", slot.secondary_port.to_string());
        }

        debug!(phase = %phase, attempt, program = %self.program, "spawning agent command");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn agent command '{}'", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(Outcome::success_with(parse_artifacts(&stdout)))
        } else {
            let detail = if stderr.trim().is_empty() {
                tail_lines(&stdout, DIAGNOSTIC_TAIL_LINES)
            } else {
                tail_lines(&stderr, DIAGNOSTIC_TAIL_LINES)
            };
            let diagnostic = if detail.is_empty() {
                format!("agent command exited with {}", output.status)
            } else {
                detail
            };
            Ok(Outcome::failure(diagnostic))
        }
    }
}

/// A JSON object anywhere in the agent's stdout is the artifact map.
fn parse_artifacts(stdout: &str) -> BTreeMap<String, Value> {
    extract_json_object(stdout)
        .and_then(|payload| serde_json::from_str::<Value>(&payload).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map.into_iter().collect()),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::WorkflowId;

    fn record() -> WorkflowRecord {
        WorkflowRecord::new(WorkflowId::new("wf-001").unwrap())
    }

    #[test]
    fn test_command_line_splitting() {
        let exec = CommandExecutor::new("claude --print --output-format json");
        assert_eq!(exec.program, "claude");
        assert_eq!(exec.args, vec!["--print", "--output-format", "json"]);
    }

    #[test]
    fn test_parse_artifacts_from_noisy_output() {
        let stdout = "Phase complete.\n{\"branch_name\": \"conveyor/wf-001\"}\nbye";
        let artifacts = parse_artifacts(stdout);
        assert_eq!(
            artifacts.get("branch_name"),
            Some(&Value::String("conveyor/wf-001".into()))
        );
    }

    #[test]
    fn test_parse_artifacts_ignores_non_objects() {
        assert!(parse_artifacts("all good, nothing structured").is_empty());
        assert!(parse_artifacts("[1, 2, 3]").is_empty());
    }

    #[tokio::test]
    async fn test_successful_command_yields_success() {
        let exec = CommandExecutor::new("true");
        let outcome = exec.execute(&record(), Phase::Discovery, 1, None).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_failing_command_yields_failure_with_diagnostic() {
        let exec = CommandExecutor::new("false");
        let outcome = exec.execute(&record(), Phase::Discovery, 1, None).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.diagnostic.is_some());
    }

    #[tokio::test]
    async fn test_missing_command_is_infrastructure_error() {
        let exec = CommandExecutor::new("definitely-not-a-real-binary-7f3a");
        let result = exec.execute(&record(), Phase::Discovery, 1, None).await;
        assert!(result.is_err());
    }
}

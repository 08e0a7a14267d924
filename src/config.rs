//! Configuration for the Conveyor engine.
//!
//! Settings are read from `.conveyor/conveyor.toml` in the project
//! directory; every field has a sensible default and the file is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pool]
//! capacity = 15
//! primary_base = 9100
//! secondary_base = 9200
//!
//! [workspaces]
//! root = "trees"
//! source_ref = "main"
//!
//! [orchestrator]
//! stale_running_minutes = 120
//!
//! [retries]
//! unit_tests = 4
//! e2e_tests = 2
//! review = 3
//!
//! [agent]
//! command = "claude"
//! ```

use anyhow::{Context, Result};
use conveyor_common::{
    Phase, DEFAULT_POOL_CAPACITY, DEFAULT_PRIMARY_PORT_BASE, DEFAULT_SECONDARY_PORT_BASE,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Number of concurrent isolation slots
    pub pool_capacity: usize,
    pub primary_port_base: u16,
    pub secondary_port_base: u16,
    /// Directory that holds per-workflow workspaces
    pub workspace_root: PathBuf,
    /// Ref workspaces are branched from
    pub source_ref: String,
    /// Minutes after which a `running` phase marker is treated as abandoned
    pub stale_running_minutes: i64,
    /// Per-phase retry budget overrides
    pub retry_overrides: HashMap<Phase, u32>,
    /// Agent command spawned by the default executor
    pub agent_command: String,
}

impl Config {
    /// Load configuration from `.conveyor/conveyor.toml` under the project
    /// directory. Returns defaults if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::defaults(project_dir);

        let config_path = project_dir.join(".conveyor").join("conveyor.toml");
        if !config_path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let toml: ConveyorToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if let Some(pool) = toml.pool {
            if let Some(capacity) = pool.capacity {
                anyhow::ensure!(capacity > 0, "pool.capacity must be at least 1");
                config.pool_capacity = capacity;
            }
            if let Some(base) = pool.primary_base {
                config.primary_port_base = base;
            }
            if let Some(base) = pool.secondary_base {
                config.secondary_port_base = base;
            }
        }
        if let Some(workspaces) = toml.workspaces {
            if let Some(root) = workspaces.root {
                config.workspace_root = project_dir.join(root);
            }
            if let Some(source_ref) = workspaces.source_ref {
                config.source_ref = source_ref;
            }
        }
        if let Some(orchestrator) = toml.orchestrator {
            if let Some(minutes) = orchestrator.stale_running_minutes {
                config.stale_running_minutes = minutes;
            }
        }
        if let Some(retries) = toml.retries {
            for (name, attempts) in retries {
                let phase: Phase = name
                    .parse()
                    .with_context(|| format!("Invalid phase in [retries]: '{}'", name))?;
                anyhow::ensure!(attempts > 0, "retries.{} must be at least 1", name);
                config.retry_overrides.insert(phase, attempts);
            }
        }
        if let Some(agent) = toml.agent
            && let Some(command) = agent.command
        {
            config.agent_command = command;
        }

        Ok(config)
    }

    fn defaults(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            primary_port_base: DEFAULT_PRIMARY_PORT_BASE,
            secondary_port_base: DEFAULT_SECONDARY_PORT_BASE,
            workspace_root: project_dir.join("trees"),
            source_ref: "main".to_string(),
            stale_running_minutes: 120,
            retry_overrides: HashMap::new(),
            agent_command: "claude".to_string(),
        }
    }

    /// Retry budget for a phase, honoring overrides.
    pub fn max_attempts_for(&self, phase: Phase) -> u32 {
        self.retry_overrides
            .get(&phase)
            .copied()
            .unwrap_or_else(|| phase.default_max_attempts())
    }

    /// Directory holding per-workflow state records.
    pub fn state_root(&self) -> PathBuf {
        self.project_dir.join(".conveyor").join("workflows")
    }
}

/// Raw TOML structure for `.conveyor/conveyor.toml`
#[derive(Debug, Deserialize)]
struct ConveyorToml {
    pool: Option<PoolSection>,
    workspaces: Option<WorkspacesSection>,
    orchestrator: Option<OrchestratorSection>,
    retries: Option<HashMap<String, u32>>,
    agent: Option<AgentSection>,
}

#[derive(Debug, Deserialize)]
struct PoolSection {
    capacity: Option<usize>,
    primary_base: Option<u16>,
    secondary_base: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct WorkspacesSection {
    root: Option<String>,
    source_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrchestratorSection {
    stale_running_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    command: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.pool_capacity, 15);
        assert_eq!(config.primary_port_base, 9100);
        assert_eq!(config.secondary_port_base, 9200);
        assert_eq!(config.workspace_root, dir.path().join("trees"));
        assert_eq!(config.source_ref, "main");
        assert_eq!(config.stale_running_minutes, 120);
        assert_eq!(config.max_attempts_for(Phase::UnitTests), 4);
        assert_eq!(config.max_attempts_for(Phase::Deploy), 1);
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempdir().unwrap();
        let conveyor_dir = dir.path().join(".conveyor");
        fs::create_dir_all(&conveyor_dir).unwrap();
        fs::write(
            conveyor_dir.join("conveyor.toml"),
            r#"
[pool]
capacity = 8
primary_base = 7100

[workspaces]
root = "sandboxes"
source_ref = "develop"

[orchestrator]
stale_running_minutes = 30

[retries]
unit_tests = 6
deploy = 2
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.primary_port_base, 7100);
        assert_eq!(config.secondary_port_base, 9200);
        assert_eq!(config.workspace_root, dir.path().join("sandboxes"));
        assert_eq!(config.source_ref, "develop");
        assert_eq!(config.stale_running_minutes, 30);
        assert_eq!(config.max_attempts_for(Phase::UnitTests), 6);
        assert_eq!(config.max_attempts_for(Phase::Deploy), 2);
        assert_eq!(config.max_attempts_for(Phase::E2eTests), 2);
    }

    #[test]
    fn test_invalid_phase_name_rejected() {
        let dir = tempdir().unwrap();
        let conveyor_dir = dir.path().join(".conveyor");
        fs::create_dir_all(&conveyor_dir).unwrap();
        fs::write(
            conveyor_dir.join("conveyor.toml"),
            "[retries]\nnot_a_phase = 3\n",
        )
        .unwrap();

        let result = Config::load(dir.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not_a_phase"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempdir().unwrap();
        let conveyor_dir = dir.path().join(".conveyor");
        fs::create_dir_all(&conveyor_dir).unwrap();
        fs::write(conveyor_dir.join("conveyor.toml"), "[pool]\ncapacity = 0\n").unwrap();

        assert!(Config::load(dir.path()).is_err());
    }
}

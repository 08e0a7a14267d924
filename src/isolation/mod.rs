//! Deterministic workspace and port isolation.
//!
//! Every workflow id hashes to a slot in a fixed pool. A slot owns a port
//! pair (`primary_base + index`, `secondary_base + index`) and the
//! workspace directory `<workspace_root>/<id>`. Because the mapping is pure,
//! independent processes agree on an id's assignment with no coordination,
//! and a lost record can be re-derived from the id alone.
//!
//! Collisions are resolved by probing `(index + k) % capacity` in order,
//! checking liveness with a real bind attempt rather than stored
//! bookkeeping, which may be stale. The probe order is fixed, so allocation
//! under unchanged occupancy is idempotent.

pub mod worktree;

use crate::config::Config;
use crate::errors::IsolationError;
use conveyor_common::{IsolationSlot, WorkflowId, WorkspaceProvisioner};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Liveness check for a candidate port.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Production probe: attempt a real TCP bind on the loopback interface.
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Derives and provisions isolation slots.
pub struct IsolationAllocator {
    pool_capacity: usize,
    primary_base: u16,
    secondary_base: u16,
    workspace_root: PathBuf,
    source_ref: String,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    probe: Arc<dyn PortProbe>,
}

impl IsolationAllocator {
    pub fn new(config: &Config, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        Self {
            pool_capacity: config.pool_capacity,
            primary_base: config.primary_port_base,
            secondary_base: config.secondary_port_base,
            workspace_root: config.workspace_root.clone(),
            source_ref: config.source_ref.clone(),
            provisioner,
            probe: Arc::new(TcpProbe),
        }
    }

    /// Substitute the port liveness probe (tests).
    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The slot an id hashes to before any collision fallback.
    pub fn derive_index(&self, id: &WorkflowId) -> usize {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.pool_capacity as u64) as usize
    }

    /// Side-effect-free view of an id's derived assignment. Does not probe
    /// occupancy and does not touch the filesystem.
    pub fn peek(&self, id: &WorkflowId) -> IsolationSlot {
        self.slot_for(id, self.derive_index(id))
    }

    /// Allocate an isolation slot for the id: find a live-free port pair by
    /// deterministic probing, provision the workspace, and write its
    /// `.ports.env`.
    pub async fn allocate(&self, id: &WorkflowId) -> Result<IsolationSlot, IsolationError> {
        let base = self.derive_index(id);

        for k in 0..self.pool_capacity {
            let index = (base + k) % self.pool_capacity;
            let slot = self.slot_for(id, index);

            if !self.probe.is_free(slot.primary_port) || !self.probe.is_free(slot.secondary_port)
            {
                debug!(
                    id = %id,
                    index,
                    primary = slot.primary_port,
                    "slot ports in use, probing next"
                );
                continue;
            }

            if k > 0 {
                warn!(
                    id = %id,
                    derived = base,
                    index,
                    "derived slot occupied, fell back to probe offset {k}"
                );
            }

            if !slot.workspace_path.exists() {
                self.provisioner
                    .create_workspace(&slot.workspace_path, &self.source_ref)
                    .await
                    .map_err(|source| IsolationError::WorkspaceCreate {
                        path: slot.workspace_path.clone(),
                        source,
                    })?;
            }
            self.write_ports_env(&slot)?;

            info!(
                id = %id,
                workspace = %slot.workspace_path.display(),
                primary = slot.primary_port,
                secondary = slot.secondary_port,
                "allocated isolation slot"
            );
            return Ok(slot);
        }

        Err(IsolationError::PoolExhausted {
            pool_size: self.pool_capacity,
        })
    }

    /// Tear down a slot's workspace. Safe on a slot that was never fully
    /// created and safe to call twice.
    pub async fn release(&self, slot: &IsolationSlot) -> Result<(), IsolationError> {
        self.provisioner
            .remove_workspace(&slot.workspace_path)
            .await
            .map_err(|source| IsolationError::WorkspaceRemove {
                path: slot.workspace_path.clone(),
                source,
            })?;
        info!(workspace = %slot.workspace_path.display(), "released isolation slot");
        Ok(())
    }

    fn slot_for(&self, id: &WorkflowId, index: usize) -> IsolationSlot {
        IsolationSlot {
            workspace_path: self.workspace_root.join(id.as_str()),
            slot_index: index,
            primary_port: self.primary_base + index as u16,
            secondary_port: self.secondary_base + index as u16,
        }
    }

    /// Drop the port assignment into the workspace so the dev servers
    /// started inside it pick up their isolated ports.
    fn write_ports_env(&self, slot: &IsolationSlot) -> Result<(), IsolationError> {
        let path = slot.workspace_path.join(".ports.env");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            writeln!(file, "CONVEYOR_PRIMARY_PORT={}", slot.primary_port)?;
            writeln!(file, "CONVEYOR_SECONDARY_PORT={}", slot.secondary_port)?;
            Ok(())
        };
        write().map_err(|source| IsolationError::PortsFile { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Provisioner double that creates plain directories and counts calls.
    struct DirProvisioner {
        creates: Mutex<u32>,
        removes: Mutex<u32>,
    }

    impl DirProvisioner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creates: Mutex::new(0),
                removes: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl conveyor_common::WorkspaceProvisioner for DirProvisioner {
        async fn create_workspace(&self, path: &Path, _source_ref: &str) -> Result<()> {
            std::fs::create_dir_all(path)?;
            *self.creates.lock().unwrap() += 1;
            Ok(())
        }

        async fn remove_workspace(&self, path: &Path) -> Result<()> {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            *self.removes.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Probe double with a fixed occupancy set.
    struct FixedProbe {
        occupied: HashSet<u16>,
    }

    impl FixedProbe {
        fn free() -> Arc<Self> {
            Arc::new(Self {
                occupied: HashSet::new(),
            })
        }

        fn occupying(ports: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                occupied: ports.iter().copied().collect(),
            })
        }
    }

    impl PortProbe for FixedProbe {
        fn is_free(&self, port: u16) -> bool {
            !self.occupied.contains(&port)
        }
    }

    fn wf(id: &str) -> WorkflowId {
        WorkflowId::new(id).unwrap()
    }

    fn make_allocator(
        dir: &Path,
        provisioner: Arc<DirProvisioner>,
        probe: Arc<dyn PortProbe>,
    ) -> IsolationAllocator {
        let config = Config::load(dir).unwrap();
        IsolationAllocator::new(&config, provisioner).with_probe(probe)
    }

    #[test]
    fn test_derivation_is_deterministic_and_stable() {
        let dir = tempdir().unwrap();
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), FixedProbe::free());

        // sha256("wf-001")[..8] as u64 is 10 mod 15.
        let slot = alloc.peek(&wf("wf-001"));
        assert_eq!(slot.slot_index, 10);
        assert_eq!(slot.primary_port, 9110);
        assert_eq!(slot.secondary_port, 9210);

        // A second allocator instance agrees (stable across processes).
        let again = make_allocator(dir.path(), DirProvisioner::new(), FixedProbe::free());
        assert_eq!(again.peek(&wf("wf-001")), slot);
    }

    #[test]
    fn test_distinct_ids_distinct_ports_under_empty_occupancy() {
        let dir = tempdir().unwrap();
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), FixedProbe::free());

        let ids = ["alpha", "bravo", "charlie", "delta"];
        let mut primaries = HashSet::new();
        for id in ids {
            let slot = alloc.peek(&wf(id));
            assert!(
                primaries.insert(slot.primary_port),
                "port collision for {}",
                id
            );
        }
    }

    #[tokio::test]
    async fn test_allocate_provisions_workspace_and_ports_env() {
        let dir = tempdir().unwrap();
        let provisioner = DirProvisioner::new();
        let alloc = make_allocator(dir.path(), provisioner.clone(), FixedProbe::free());

        let slot = alloc.allocate(&wf("wf-001")).await.unwrap();
        assert!(slot.workspace_path.ends_with("trees/wf-001"));
        assert!(slot.workspace_path.exists());

        let ports_env =
            std::fs::read_to_string(slot.workspace_path.join(".ports.env")).unwrap();
        assert!(ports_env.contains("CONVEYOR_PRIMARY_PORT=9110"));
        assert!(ports_env.contains("CONVEYOR_SECONDARY_PORT=9210"));
        assert_eq!(*provisioner.creates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_under_unchanged_occupancy() {
        let dir = tempdir().unwrap();
        let provisioner = DirProvisioner::new();
        let alloc = make_allocator(dir.path(), provisioner.clone(), FixedProbe::free());

        let first = alloc.allocate(&wf("wf-001")).await.unwrap();
        let second = alloc.allocate(&wf("wf-001")).await.unwrap();

        assert_eq!(first, second);
        // Existing workspace is reused, not re-provisioned.
        assert_eq!(*provisioner.creates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collision_falls_back_to_next_slot() {
        let dir = tempdir().unwrap();
        // wf-007 also hashes to slot 10; occupy it.
        let probe = FixedProbe::occupying(&[9110]);
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), probe);

        let slot = alloc.allocate(&wf("wf-007")).await.unwrap();
        assert_eq!(slot.slot_index, 11);
        assert_eq!(slot.primary_port, 9111);
        assert_eq!(slot.secondary_port, 9211);
    }

    #[tokio::test]
    async fn test_occupied_secondary_port_also_skips_slot() {
        let dir = tempdir().unwrap();
        let probe = FixedProbe::occupying(&[9210]);
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), probe);

        let slot = alloc.allocate(&wf("wf-001")).await.unwrap();
        assert_eq!(slot.slot_index, 11);
    }

    #[tokio::test]
    async fn test_probe_wraps_around_pool() {
        let dir = tempdir().unwrap();
        // alpha hashes to slot 14 (last in pool); occupy it to force wrap.
        let probe = FixedProbe::occupying(&[9114]);
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), probe);

        let slot = alloc.allocate(&wf("alpha")).await.unwrap();
        assert_eq!(slot.slot_index, 0);
        assert_eq!(slot.primary_port, 9100);
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_all_slots_occupied() {
        let dir = tempdir().unwrap();
        let all_ports: Vec<u16> = (9100..9115).collect();
        let probe = FixedProbe::occupying(&all_ports);
        let alloc = make_allocator(dir.path(), DirProvisioner::new(), probe);

        let result = alloc.allocate(&wf("wf-001")).await;
        assert!(matches!(
            result,
            Err(IsolationError::PoolExhausted { pool_size: 15 })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let provisioner = DirProvisioner::new();
        let alloc = make_allocator(dir.path(), provisioner.clone(), FixedProbe::free());

        let slot = alloc.allocate(&wf("wf-001")).await.unwrap();
        alloc.release(&slot).await.unwrap();
        assert!(!slot.workspace_path.exists());

        // Second release and release of a never-created slot are no-ops.
        alloc.release(&slot).await.unwrap();
        let phantom = alloc.peek(&wf("wf-002"));
        alloc.release(&phantom).await.unwrap();
    }

    #[test]
    fn test_tcp_probe_reflects_live_binds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe;
        assert!(!probe.is_free(port));
        drop(listener);
        assert!(probe.is_free(port));
    }
}

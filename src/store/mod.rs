//! Durable, versioned storage for workflow records.
//!
//! One JSON document per workflow at `<root>/<id>/state.json`, readable by
//! downstream tooling without going through this crate. Writes are
//! all-or-nothing: the new document is written to a temp file, fsynced, and
//! atomically renamed over the old one, so a concurrent reader never
//! observes a partial record. Read-modify-write cycles are serialized
//! across processes with an advisory lock on `<id>/state.lock`.

use crate::errors::StoreError;
use conveyor_common::{AttemptRecord, Phase, WorkflowId, WorkflowRecord};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File-backed state store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one workflow's record and lock file.
    pub fn record_dir(&self, id: &WorkflowId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Path of the durable record (the exposed file layout).
    pub fn record_path(&self, id: &WorkflowId) -> PathBuf {
        self.record_dir(id).join("state.json")
    }

    pub fn exists(&self, id: &WorkflowId) -> bool {
        self.record_path(id).exists()
    }

    /// Create a fresh record. Fails with `AlreadyExists` if the id already
    /// has one.
    pub fn create(&self, id: &WorkflowId) -> Result<WorkflowRecord, StoreError> {
        let _lock = self.lock(id)?;
        if self.exists(id) {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        let mut record = WorkflowRecord::new(id.clone());
        self.write_record(&mut record)?;
        debug!(id = %id, "created workflow record");
        Ok(record)
    }

    /// Load a record, upgrading older schema versions in memory.
    pub fn load(&self, id: &WorkflowId) -> Result<WorkflowRecord, StoreError> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(source) => return Err(StoreError::Persistence { path, source }),
        };
        let mut record: WorkflowRecord =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;
        record.upgrade();
        Ok(record)
    }

    /// Durably write a record, refreshing `updated_at` and the legacy
    /// mirror fields.
    pub fn save(&self, record: &mut WorkflowRecord) -> Result<(), StoreError> {
        let _lock = self.lock(&record.id.clone())?;
        self.write_record(record)
    }

    /// Apply a mutation under the per-id lock and persist the result.
    ///
    /// The closure sees the freshest on-disk state, so concurrent writers
    /// (two parallel phases finishing near-simultaneously) cannot lose each
    /// other's updates.
    pub fn update<F>(&self, id: &WorkflowId, mutate: F) -> Result<WorkflowRecord, StoreError>
    where
        F: FnOnce(&mut WorkflowRecord),
    {
        let _lock = self.lock(id)?;
        let mut record = self.load(id)?;
        mutate(&mut record);
        self.write_record(&mut record)?;
        Ok(record)
    }

    /// Append an attempt under a phase's entry. Previously recorded attempts
    /// are never dropped: the whole document is rewritten atomically with
    /// the new attempt added.
    pub fn append_attempt(
        &self,
        id: &WorkflowId,
        phase: Phase,
        attempt: AttemptRecord,
    ) -> Result<WorkflowRecord, StoreError> {
        self.update(id, |record| record.record_attempt(phase, attempt))
    }

    /// All workflow ids with a stored record.
    pub fn list(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Persistence {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(id) = WorkflowId::new(name)
                && self.exists(&id)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Acquire the per-id advisory lock. Released when the returned file
    /// handle drops.
    fn lock(&self, id: &WorkflowId) -> Result<File, StoreError> {
        let dir = self.record_dir(id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Persistence {
            path: dir.clone(),
            source,
        })?;
        let lock_path = dir.join("state.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Persistence {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| StoreError::Persistence {
                path: lock_path,
                source,
            })?;
        Ok(file)
    }

    /// Write-to-temp, fsync, atomic rename. Caller must hold the lock.
    fn write_record(&self, record: &mut WorkflowRecord) -> Result<(), StoreError> {
        record.updated_at = chrono::Utc::now();
        record.sync_legacy_fields();

        let path = self.record_path(&record.id);
        let content = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Persistence {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;

        let tmp_path = path.with_extension("json.tmp");
        write_atomic(&tmp_path, &path, &content).map_err(|source| StoreError::Persistence {
            path: path.clone(),
            source,
        })?;
        debug!(id = %record.id, path = %path.display(), "persisted workflow record");
        Ok(())
    }
}

fn write_atomic(tmp_path: &Path, final_path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = File::create(tmp_path)?;
    tmp.write_all(content)?;
    // The data must be durable before the rename makes it visible.
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(tmp_path, final_path)?;
    // Make the rename itself durable where the platform allows it.
    if let Some(dir) = final_path.parent()
        && let Ok(dir_handle) = File::open(dir)
    {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

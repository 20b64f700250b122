// ABOUTME: Per-workload deploy lock: at most one non-terminal run per workload.
// ABOUTME: In-process table plus atomically created lock files under <state_dir>/locks/.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{RunId, WorkloadId};

use super::DeployError;

/// Information about who holds a workload lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolderInfo {
    pub workload: WorkloadId,
    /// Run the lock was taken for.
    pub run: RunId,
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockHolderInfo {
    /// Lock info for `run` owned by the current process.
    pub fn new(workload: &WorkloadId, run: &RunId) -> Self {
        Self {
            workload: workload.clone(),
            run: run.clone(),
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// Table of held workload locks, shared between clones.
///
/// With a lock directory, every lock is also an exclusively created file so
/// that processes sharing a state directory exclude each other.
#[derive(Debug, Clone)]
pub struct WorkloadLocks {
    dir: Option<PathBuf>,
    held: Arc<Mutex<HashMap<WorkloadId, LockHolderInfo>>>,
}

impl WorkloadLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            held: Arc::default(),
        }
    }

    /// Locks that only exclude runs within this process.
    pub fn in_process() -> Self {
        Self {
            dir: None,
            held: Arc::default(),
        }
    }

    fn lock_path(&self, workload: &WorkloadId) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{workload}.lock")))
    }

    /// Take the lock of `workload` for `run`.
    ///
    /// Fails with `DeploymentInProgress` while another run holds it.
    pub fn acquire(&self, workload: &WorkloadId, run: &RunId) -> Result<WorkloadLock, DeployError> {
        let mut held = self.held.lock();
        if let Some(existing) = held.get(workload) {
            return Err(DeployError::DeploymentInProgress {
                workload: workload.clone(),
                holder: Some(existing.clone()),
            });
        }

        let info = LockHolderInfo::new(workload, run);
        if let Some(path) = self.lock_path(workload) {
            self.create_lock_file(&path, &info)?;
        }

        held.insert(workload.clone(), info);
        Ok(WorkloadLock {
            locks: self.clone(),
            workload: workload.clone(),
            run: run.clone(),
        })
    }

    /// Take over the lock `run` held before a restart.
    ///
    /// A lock file naming the same run is adopted. A missing lock is taken
    /// fresh. A lock naming a different run is refused.
    pub fn adopt(&self, workload: &WorkloadId, run: &RunId) -> Result<WorkloadLock, DeployError> {
        match self.holder(workload)? {
            Some(existing) if &existing.run == run => {
                tracing::info!(
                    workload = %workload,
                    run = %run,
                    "adopting lock held by {} (pid {}) since {}",
                    existing.holder,
                    existing.pid,
                    existing.started_at
                );
                let mut held = self.held.lock();
                if held.contains_key(workload) {
                    return Err(DeployError::DeploymentInProgress {
                        workload: workload.clone(),
                        holder: Some(existing),
                    });
                }
                let info = LockHolderInfo::new(workload, run);
                if let Some(path) = self.lock_path(workload) {
                    write_lock_info(&path, &info)?;
                }
                held.insert(workload.clone(), info);
                Ok(WorkloadLock {
                    locks: self.clone(),
                    workload: workload.clone(),
                    run: run.clone(),
                })
            }
            Some(existing) => Err(DeployError::DeploymentInProgress {
                workload: workload.clone(),
                holder: Some(existing),
            }),
            None => self.acquire(workload, run),
        }
    }

    /// Current holder of the lock of `workload`, if any.
    pub fn holder(&self, workload: &WorkloadId) -> Result<Option<LockHolderInfo>, DeployError> {
        if let Some(info) = self.held.lock().get(workload) {
            return Ok(Some(info.clone()));
        }
        match self.lock_path(workload) {
            Some(path) => read_lock_info(&path),
            None => Ok(None),
        }
    }

    /// Remove a lock left behind by a run that has terminated or whose
    /// process is gone.
    pub fn break_lock(&self, workload: &WorkloadId) -> Result<(), DeployError> {
        if let Some(path) = self.lock_path(workload) {
            tracing::warn!(workload = %workload, "breaking stale lock at {}", path.display());
            remove_lock_file(&path)?;
        }
        self.held.lock().remove(workload);
        Ok(())
    }

    fn create_lock_file(&self, path: &Path, info: &LockHolderInfo) -> Result<(), DeployError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                DeployError::Lock(format!("failed to create lock directory: {e}"))
            })?;
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);

        match file {
            Ok(mut file) => {
                let json = serde_json::to_vec(info)
                    .map_err(|e| DeployError::Lock(format!("failed to serialize lock: {e}")))?;
                file.write_all(&json)
                    .map_err(|e| DeployError::Lock(format!("failed to write lock: {e}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|content| serde_json::from_str::<LockHolderInfo>(&content).ok());
                Err(DeployError::DeploymentInProgress {
                    workload: info.workload.clone(),
                    holder,
                })
            }
            Err(e) => Err(DeployError::Lock(format!(
                "failed to create lock file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Drop the lock of `run`. A lock file now naming another run is kept.
    fn release(&self, workload: &WorkloadId, run: &RunId) {
        let mut held = self.held.lock();
        if !held.get(workload).is_some_and(|info| &info.run == run) {
            return;
        }
        held.remove(workload);

        let Some(path) = self.lock_path(workload) else {
            return;
        };
        match read_lock_info(&path) {
            Ok(Some(info)) if &info.run == run => {
                if let Err(e) = remove_lock_file(&path) {
                    tracing::warn!(workload = %workload, "{e}");
                }
            }
            Ok(Some(info)) => {
                tracing::warn!(workload = %workload, run = %run, "lock now held by run {}, leaving it", info.run);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(workload = %workload, "{e}"),
        }
    }
}

/// Whether the process that wrote `info` is known to be gone.
///
/// Only a holder on this host can be checked; a pid without a `/proc`
/// entry is dead. Holders elsewhere are assumed alive.
pub fn holder_is_dead(info: &LockHolderInfo) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    info.holder == host && !Path::new("/proc").join(info.pid.to_string()).exists()
}

fn read_lock_info(path: &Path) -> Result<Option<LockHolderInfo>, DeployError> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<LockHolderInfo>(&content)
            .map(Some)
            .map_err(|e| DeployError::Lock(format!("lock file {} is corrupt: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DeployError::Lock(format!(
            "failed to read lock file {}: {e}",
            path.display()
        ))),
    }
}

fn write_lock_info(path: &Path, info: &LockHolderInfo) -> Result<(), DeployError> {
    let json = serde_json::to_vec(info)
        .map_err(|e| DeployError::Lock(format!("failed to serialize lock: {e}")))?;
    std::fs::write(path, json).map_err(|e| DeployError::Lock(format!("failed to write lock: {e}")))
}

fn remove_lock_file(path: &Path) -> Result<(), DeployError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DeployError::Lock(format!(
            "failed to remove lock file {}: {e}",
            path.display()
        ))),
    }
}

/// A held workload lock that releases on drop.
pub struct WorkloadLock {
    locks: WorkloadLocks,
    workload: WorkloadId,
    run: RunId,
}

impl std::fmt::Debug for WorkloadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadLock")
            .field("workload", &self.workload)
            .field("run", &self.run)
            .finish()
    }
}

impl WorkloadLock {
    pub fn workload(&self) -> &WorkloadId {
        &self.workload
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WorkloadLock {
    fn drop(&mut self) {
        self.locks.release(&self.workload, &self.run);
    }
}

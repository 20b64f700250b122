// ABOUTME: Durable storage for run records, abort requests, and rejected pushes.
// ABOUTME: File store under the state directory plus an in-memory store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::types::{Revision, RunId, WorkloadId};

use super::run::DeploymentRun;
use super::FailureReason;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("run store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A push that never became a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub at: DateTime<Utc>,
    pub workload: WorkloadId,
    pub revision: Revision,
    pub reason: FailureReason,
}

impl Rejection {
    pub fn new(workload: WorkloadId, revision: Revision, reason: FailureReason) -> Self {
        Self {
            at: Utc::now(),
            workload,
            revision,
            reason,
        }
    }
}

/// Where runs live. Runs are never deleted.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record.
    async fn save(&self, run: &DeploymentRun) -> Result<(), StoreError>;

    async fn load(&self, id: &RunId) -> Result<DeploymentRun, StoreError>;

    /// Every run, oldest first.
    async fn list(&self) -> Result<Vec<DeploymentRun>, StoreError>;

    async fn request_abort(&self, id: &RunId) -> Result<(), StoreError>;

    async fn abort_requested(&self, id: &RunId) -> Result<bool, StoreError>;

    async fn record_rejection(&self, rejection: &Rejection) -> Result<(), StoreError>;

    /// Rejections, oldest first.
    async fn rejections(&self) -> Result<Vec<Rejection>, StoreError>;

    async fn non_terminal(&self) -> Result<Vec<DeploymentRun>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    /// Runs of one workload, oldest first.
    async fn for_workload(&self, workload: &WorkloadId) -> Result<Vec<DeploymentRun>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| &r.workload == workload)
            .collect())
    }

    async fn latest_for(&self, workload: &WorkloadId) -> Result<Option<DeploymentRun>, StoreError> {
        Ok(self.for_workload(workload).await?.pop())
    }
}

fn sort_runs(runs: &mut [DeploymentRun]) {
    runs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One JSON document per run under `<state_dir>/runs/`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    runs_dir: PathBuf,
    aborts_dir: PathBuf,
    rejections_path: PathBuf,
}

impl FileRunStore {
    pub async fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let store = Self {
            runs_dir: state_dir.join("runs"),
            aborts_dir: state_dir.join("aborts"),
            rejections_path: state_dir.join("rejections.jsonl"),
        };
        for dir in [&store.runs_dir, &store.aborts_dir] {
            fs::create_dir_all(dir).await.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(store)
    }

    fn run_path(&self, id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{id}.json"))
    }

    fn abort_path(&self, id: &RunId) -> PathBuf {
        self.aborts_dir.join(id.as_str())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, run: &DeploymentRun) -> Result<(), StoreError> {
        let path = self.run_path(&run.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(run)?;

        let mut file = fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
        file.write_all(&json).await.map_err(io_error(&tmp))?;
        file.sync_all().await.map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &path).await.map_err(io_error(&path))
    }

    async fn load(&self, id: &RunId) -> Result<DeploymentRun, StoreError> {
        let path = self.run_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn list(&self) -> Result<Vec<DeploymentRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.runs_dir)
            .await
            .map_err(io_error(&self.runs_dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.runs_dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(io_error(&path))?;
            let run = serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Corrupt { path, source })?;
            runs.push(run);
        }

        sort_runs(&mut runs);
        Ok(runs)
    }

    async fn request_abort(&self, id: &RunId) -> Result<(), StoreError> {
        if !fs::try_exists(self.run_path(id)).await.unwrap_or(false) {
            return Err(StoreError::NotFound(id.clone()));
        }
        let path = self.abort_path(id);
        fs::write(&path, Utc::now().to_rfc3339())
            .await
            .map_err(io_error(&path))
    }

    async fn abort_requested(&self, id: &RunId) -> Result<bool, StoreError> {
        let path = self.abort_path(id);
        fs::try_exists(&path).await.map_err(io_error(&path))
    }

    async fn record_rejection(&self, rejection: &Rejection) -> Result<(), StoreError> {
        let path = &self.rejections_path;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_error(path))?;

        let json = serde_json::to_string(rejection)?;
        file.write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(io_error(path))?;
        file.flush().await.map_err(io_error(path))
    }

    async fn rejections(&self) -> Result<Vec<Rejection>, StoreError> {
        let path = &self.rejections_path;
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }
}

/// Runs held in memory, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    runs: Arc<Mutex<HashMap<RunId, DeploymentRun>>>,
    aborts: Arc<Mutex<HashSet<RunId>>>,
    rejections: Arc<Mutex<Vec<Rejection>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &DeploymentRun) -> Result<(), StoreError> {
        self.runs.lock().insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load(&self, id: &RunId) -> Result<DeploymentRun, StoreError> {
        self.runs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<DeploymentRun>, StoreError> {
        let mut runs: Vec<_> = self.runs.lock().values().cloned().collect();
        sort_runs(&mut runs);
        Ok(runs)
    }

    async fn request_abort(&self, id: &RunId) -> Result<(), StoreError> {
        if !self.runs.lock().contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.aborts.lock().insert(id.clone());
        Ok(())
    }

    async fn abort_requested(&self, id: &RunId) -> Result<bool, StoreError> {
        Ok(self.aborts.lock().contains(id))
    }

    async fn record_rejection(&self, rejection: &Rejection) -> Result<(), StoreError> {
        self.rejections.lock().push(rejection.clone());
        Ok(())
    }

    async fn rejections(&self) -> Result<Vec<Rejection>, StoreError> {
        Ok(self.rejections.lock().clone())
    }
}

// ABOUTME: Error taxonomy for resolution, planning, rollout, verification, and rollback.
// ABOUTME: Provides a kind() for programmatic handling and the persisted FailureReason.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::ClusterError;
use crate::registry::RegistryError;
use crate::types::{RunId, WorkloadId};

use super::lock::LockHolderInfo;
use super::store::StoreError;

/// Errors that can occur while driving a deployment.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// No artifact exists for the revision yet.
    #[error("no artifact built for {repository}:{tag} (revision {revision})")]
    NotBuilt {
        revision: String,
        repository: String,
        tag: String,
    },

    /// The registry could not be reached after local retries.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Rollout policy or desired state admits no progress.
    #[error("invalid rollout policy: {0}")]
    InvalidPolicy(String),

    /// A non-terminal run already owns the workload.
    #[error("deployment already in progress for {workload}{}", holder_suffix(.holder))]
    DeploymentInProgress {
        workload: WorkloadId,
        holder: Option<LockHolderInfo>,
    },

    /// Applying desired state to the cluster failed after local retries.
    #[error("cluster apply failed: {0}")]
    ClusterApplyFailed(String),

    /// Verification stayed inconclusive past its deadline.
    #[error("verification timed out after {0} seconds")]
    VerificationTimeout(u64),

    /// Verification concluded the step is unhealthy.
    #[error("replicas unhealthy: {0}")]
    Unhealthy(String),

    /// Restoring the previous artifact failed. The workload may be degraded.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// The persisted plan does not match the recomputed plan.
    #[error("run {run} is inconsistent with its recomputed plan: {detail}")]
    ConsistencyError { run: RunId, detail: String },

    /// The push did not carry a passing test result and the gate requires one.
    #[error("test gate refused revision {0}")]
    TestsFailed(String),

    /// An operator asked for the run to stop.
    #[error("deployment aborted by request")]
    Aborted,

    /// The run already reached a terminal state.
    #[error("run {run} already finished as {state}")]
    RunFinished { run: RunId, state: String },

    /// The push names a workload that is not configured.
    #[error("unknown workload: {0}")]
    UnknownWorkload(WorkloadId),

    /// A pre-deploy hook refused the push.
    #[error("hook failed: {0}")]
    HookFailed(String),

    /// The workload lock could not be read or written.
    #[error("deploy lock error: {0}")]
    Lock(String),

    /// Persisting or loading a run record failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn holder_suffix(holder: &Option<LockHolderInfo>) -> String {
    match holder {
        Some(info) => format!(
            " (run {} held by {} pid {} since {})",
            info.run, info.holder, info.pid, info.started_at
        ),
        None => String::new(),
    }
}

/// Error kind for programmatic handling and for persisted run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployErrorKind {
    NotBuilt,
    RegistryUnavailable,
    InvalidPolicy,
    DeploymentInProgress,
    ClusterApplyFailed,
    VerificationTimeout,
    Unhealthy,
    RollbackFailed,
    ConsistencyError,
    TestsFailed,
    Aborted,
    RunFinished,
    UnknownWorkload,
    HookFailed,
    Lock,
    Store,
}

impl fmt::Display for DeployErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl DeployError {
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::NotBuilt { .. } => DeployErrorKind::NotBuilt,
            DeployError::RegistryUnavailable(_) => DeployErrorKind::RegistryUnavailable,
            DeployError::InvalidPolicy(_) => DeployErrorKind::InvalidPolicy,
            DeployError::DeploymentInProgress { .. } => DeployErrorKind::DeploymentInProgress,
            DeployError::ClusterApplyFailed(_) => DeployErrorKind::ClusterApplyFailed,
            DeployError::VerificationTimeout(_) => DeployErrorKind::VerificationTimeout,
            DeployError::Unhealthy(_) => DeployErrorKind::Unhealthy,
            DeployError::RollbackFailed(_) => DeployErrorKind::RollbackFailed,
            DeployError::ConsistencyError { .. } => DeployErrorKind::ConsistencyError,
            DeployError::TestsFailed(_) => DeployErrorKind::TestsFailed,
            DeployError::Aborted => DeployErrorKind::Aborted,
            DeployError::RunFinished { .. } => DeployErrorKind::RunFinished,
            DeployError::UnknownWorkload(_) => DeployErrorKind::UnknownWorkload,
            DeployError::HookFailed(_) => DeployErrorKind::HookFailed,
            DeployError::Lock(_) => DeployErrorKind::Lock,
            DeployError::Store(_) => DeployErrorKind::Store,
        }
    }

    /// Policy and persistence bugs. These are never retried and are surfaced
    /// to the operator immediately.
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self.kind(),
            DeployErrorKind::InvalidPolicy | DeployErrorKind::ConsistencyError
        )
    }

    /// Returns lock holder details if this is a `DeploymentInProgress` error.
    pub fn lock_holder_info(&self) -> Option<&LockHolderInfo> {
        match self {
            DeployError::DeploymentInProgress { holder, .. } => holder.as_ref(),
            _ => None,
        }
    }
}

impl From<RegistryError> for DeployError {
    fn from(err: RegistryError) -> Self {
        DeployError::RegistryUnavailable(err.to_string())
    }
}

impl From<ClusterError> for DeployError {
    fn from(err: ClusterError) -> Self {
        DeployError::ClusterApplyFailed(err.to_string())
    }
}

/// Why a run ended where it did. Stored on the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: DeployErrorKind,
    pub message: String,
}

impl From<&DeployError> for FailureReason {
    fn from(err: &DeployError) -> Self {
        FailureReason {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

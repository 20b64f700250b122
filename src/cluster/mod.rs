// ABOUTME: Cluster capabilities: apply desired replica counts and read replica readiness.
// ABOUTME: Engine-backed and simulated implementations share the same traits.

mod docker;
mod simulated;

pub use docker::DockerCluster;
pub use simulated::{AppliedTarget, SimulatedCluster};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use crate::types::{ArtifactRef, Digest, ReplicaId, WorkloadId};

/// Label keys stamped on every replica the orchestrator creates.
pub const LABEL_WORKLOAD: &str = "conveyor.workload";
pub const LABEL_DIGEST: &str = "conveyor.digest";
pub const LABEL_REPOSITORY: &str = "conveyor.repository";
pub const LABEL_TAG: &str = "conveyor.tag";

/// One running replica as observed in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub digest: Digest,
    /// The cluster's own readiness signal.
    pub ready: bool,
    /// Address probes connect to, when the replica has one.
    pub address: Option<IpAddr>,
}

/// Writes desired state.
#[async_trait]
pub trait ClusterApply: Send + Sync {
    /// Make exactly `replicas` replicas of `workload` run `artifact`.
    ///
    /// Replicas running other artifacts are left alone. Applying the same
    /// target twice is a no-op.
    async fn set_workload(
        &self,
        workload: &WorkloadId,
        replicas: u32,
        artifact: &ArtifactRef,
    ) -> Result<(), ClusterError>;
}

/// Reads observed state.
#[async_trait]
pub trait ClusterRead: Send + Sync {
    async fn readiness_of(&self, workload: &WorkloadId) -> Result<Vec<ReplicaStatus>, ClusterError>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    #[snafu(display("cluster connection failed: {message}"))]
    Connection { message: String },

    #[snafu(display("{operation} failed for {workload}: {message}"))]
    Operation {
        operation: &'static str,
        workload: WorkloadId,
        message: String,
    },

    #[snafu(display("{operation} did not finish within {}s", after.as_secs()))]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[snafu(display("cluster rejected desired state for {workload}: {message}"))]
    Rejected { workload: WorkloadId, message: String },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterErrorKind {
    ConnectionFailed,
    OperationFailed,
    TimedOut,
    Rejected,
}

impl ClusterError {
    pub fn kind(&self) -> ClusterErrorKind {
        match self {
            ClusterError::Connection { .. } => ClusterErrorKind::ConnectionFailed,
            ClusterError::Operation { .. } => ClusterErrorKind::OperationFailed,
            ClusterError::Timeout { .. } => ClusterErrorKind::TimedOut,
            ClusterError::Rejected { .. } => ClusterErrorKind::Rejected,
        }
    }

    /// Rejections will fail the same way again; everything else may not.
    pub fn is_transient(&self) -> bool {
        self.kind() != ClusterErrorKind::Rejected
    }
}

/// Run a cluster call under an upper time bound.
pub async fn bounded<T, F>(operation: &'static str, after: Duration, call: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Timeout { operation, after }),
    }
}

// ABOUTME: Test support utilities.
// ABOUTME: Fixtures, stores that crash or stall on save, and a cluster that degrades mid-rollout.

#![allow(dead_code)]

use async_trait::async_trait;
use conveyor::cluster::{ClusterApply, ClusterError, ClusterRead, ReplicaStatus, SimulatedCluster};
use conveyor::config::{ProbeSpec, ReadinessCheck, RolloutPolicy, Strategy, VerifyConfig};
use conveyor::deploy::{DeploymentRun, MachineConfig, MemoryRunStore, Rejection, RunStore, StoreError};
use conveyor::plan::WorkloadSpec;
use conveyor::retry::Backoff;
use conveyor::types::{ArtifactRef, Digest, RunId, WorkloadId};
use std::path::PathBuf;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env().add_directive("conveyor=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn web() -> WorkloadId {
    WorkloadId::new("web").unwrap()
}

/// Artifact of `registry.test/web` whose digest is `sha256:<hex>`.
pub fn artifact(hex: &str) -> ArtifactRef {
    ArtifactRef::new(
        "registry.test/web",
        hex,
        Digest::parse(&format!("sha256:{hex}")).unwrap(),
    )
    .unwrap()
}

pub fn readiness() -> ReadinessCheck {
    ReadinessCheck {
        probe: ProbeSpec::Cluster,
        timeout: Duration::from_secs(1),
        success_threshold: 1,
        failure_threshold: 2,
    }
}

pub fn spec(replicas: i32, artifact: Option<ArtifactRef>) -> WorkloadSpec {
    WorkloadSpec {
        workload: web(),
        replicas,
        artifact,
        readiness: readiness(),
    }
}

pub fn rolling(max_unavailable: u32, max_surge: u32) -> RolloutPolicy {
    RolloutPolicy {
        strategy: Strategy::RollingUpdate,
        max_unavailable,
        max_surge,
        step_pause: Duration::ZERO,
    }
}

pub fn recreate() -> RolloutPolicy {
    RolloutPolicy {
        strategy: Strategy::Recreate,
        max_unavailable: 1,
        max_surge: 0,
        step_pause: Duration::ZERO,
    }
}

/// Fast polling with a short deadline.
pub fn fast_verify() -> VerifyConfig {
    VerifyConfig {
        poll_interval: Duration::from_millis(5),
        timeout: Duration::from_millis(500),
    }
}

pub fn machine_config(policy: RolloutPolicy) -> MachineConfig {
    MachineConfig {
        policy,
        verify: fast_verify(),
        call_timeout: Duration::from_secs(1),
        apply_backoff: Backoff::new(2, Duration::from_millis(1)),
    }
}

/// Store that stops persisting after a fixed number of saves, the way a
/// process killed mid-run would.
pub struct CrashingStore {
    inner: MemoryRunStore,
    allowed: u64,
    saves: AtomicU64,
}

impl CrashingStore {
    pub fn after(allowed: u64, inner: MemoryRunStore) -> Self {
        Self {
            inner,
            allowed,
            saves: AtomicU64::new(0),
        }
    }

    /// Successful saves so far.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst).min(self.allowed)
    }
}

#[async_trait]
impl RunStore for CrashingStore {
    async fn save(&self, run: &DeploymentRun) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::Io {
                path: PathBuf::from("crash"),
                source: std::io::Error::other("process killed"),
            });
        }
        self.inner.save(run).await
    }

    async fn load(&self, id: &RunId) -> Result<DeploymentRun, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self) -> Result<Vec<DeploymentRun>, StoreError> {
        self.inner.list().await
    }

    async fn request_abort(&self, id: &RunId) -> Result<(), StoreError> {
        self.inner.request_abort(id).await
    }

    async fn abort_requested(&self, id: &RunId) -> Result<bool, StoreError> {
        self.inner.abort_requested(id).await
    }

    async fn record_rejection(&self, rejection: &Rejection) -> Result<(), StoreError> {
        self.inner.record_rejection(rejection).await
    }

    async fn rejections(&self) -> Result<Vec<Rejection>, StoreError> {
        self.inner.rejections().await
    }
}

/// Store whose saves each take `delay`, widening the window between a run
/// taking its lock and the run first being persisted.
pub struct SlowStore {
    inner: MemoryRunStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: MemoryRunStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl RunStore for SlowStore {
    async fn save(&self, run: &DeploymentRun) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(run).await
    }

    async fn load(&self, id: &RunId) -> Result<DeploymentRun, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self) -> Result<Vec<DeploymentRun>, StoreError> {
        self.inner.list().await
    }

    async fn request_abort(&self, id: &RunId) -> Result<(), StoreError> {
        self.inner.request_abort(id).await
    }

    async fn abort_requested(&self, id: &RunId) -> Result<bool, StoreError> {
        self.inner.abort_requested(id).await
    }

    async fn record_rejection(&self, rejection: &Rejection) -> Result<(), StoreError> {
        self.inner.record_rejection(rejection).await
    }

    async fn rejections(&self) -> Result<Vec<Rejection>, StoreError> {
        self.inner.rejections().await
    }
}

/// Cluster whose replicas of `digest` stop being ready once that digest has
/// been scaled up `after` times.
pub struct DegradingCluster {
    pub inner: SimulatedCluster,
    digest: Digest,
    after: u32,
    scale_ups: AtomicU32,
}

impl DegradingCluster {
    pub fn new(inner: SimulatedCluster, digest: Digest, after: u32) -> Self {
        Self {
            inner,
            digest,
            after,
            scale_ups: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ClusterApply for DegradingCluster {
    async fn set_workload(
        &self,
        workload: &WorkloadId,
        replicas: u32,
        artifact: &ArtifactRef,
    ) -> Result<(), ClusterError> {
        if artifact.digest() == &self.digest && replicas > 0 {
            let seen = self.scale_ups.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.after {
                self.inner.set_unready(&self.digest);
            }
        }
        self.inner.set_workload(workload, replicas, artifact).await
    }
}

#[async_trait]
impl ClusterRead for DegradingCluster {
    async fn readiness_of(&self, workload: &WorkloadId) -> Result<Vec<ReplicaStatus>, ClusterError> {
        self.inner.readiness_of(workload).await
    }
}

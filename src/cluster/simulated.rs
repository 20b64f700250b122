// ABOUTME: In-memory cluster with programmable readiness and failure injection.
// ABOUTME: Records every applied target and the replica extremes seen between applies.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::{ClusterApply, ClusterError, ClusterRead, ReplicaStatus};
use crate::types::{ArtifactRef, Digest, ReplicaId, WorkloadId};

/// One `set_workload` call as the cluster saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTarget {
    pub workload: WorkloadId,
    pub replicas: u32,
    pub digest: Digest,
}

#[derive(Debug, Clone)]
struct SimReplica {
    id: ReplicaId,
    digest: Digest,
}

#[derive(Debug, Default)]
struct Extremes {
    max_total: u32,
    min_total: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    replicas: HashMap<WorkloadId, Vec<SimReplica>>,
    unready: HashSet<Digest>,
    rejected: HashSet<Digest>,
    transient_failures: u32,
    applied: Vec<AppliedTarget>,
    extremes: HashMap<WorkloadId, Extremes>,
    next_id: u64,
    reads: u64,
}

/// Cluster held in memory. Replicas are ready as soon as they exist unless
/// their digest has been marked unready.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<State>>,
    apply_delay: Arc<Mutex<Option<Duration>>>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `workload` with `replicas` replicas of `artifact`, without
    /// recording an apply.
    pub fn seed(&self, workload: &WorkloadId, replicas: u32, artifact: &ArtifactRef) {
        let mut state = self.state.lock();
        Self::scale(&mut state, workload, replicas, artifact.digest());
        state.applied.clear();
        state.extremes.remove(workload);
    }

    /// Replicas running `digest` report not ready from now on.
    pub fn set_unready(&self, digest: &Digest) {
        self.state.lock().unready.insert(digest.clone());
    }

    /// Applies that would run replicas of `digest` fail permanently.
    /// Scaling it to zero still succeeds.
    pub fn reject(&self, digest: &Digest) {
        self.state.lock().rejected.insert(digest.clone());
    }

    /// The next `count` applies fail with a transient error.
    pub fn fail_next_applies(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Every apply waits this long before taking effect.
    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock() = Some(delay);
    }

    pub fn applied(&self) -> Vec<AppliedTarget> {
        self.state.lock().applied.clone()
    }

    /// Replica counts of `workload` per digest.
    pub fn counts(&self, workload: &WorkloadId) -> HashMap<Digest, u32> {
        let state = self.state.lock();
        let mut counts = HashMap::new();
        for replica in state.replicas.get(workload).into_iter().flatten() {
            *counts.entry(replica.digest.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Most replicas `workload` ever had after an apply.
    pub fn max_replicas(&self, workload: &WorkloadId) -> u32 {
        self.state
            .lock()
            .extremes
            .get(workload)
            .map(|e| e.max_total)
            .unwrap_or(0)
    }

    /// Fewest replicas `workload` ever had after an apply.
    pub fn min_replicas(&self, workload: &WorkloadId) -> Option<u32> {
        self.state.lock().extremes.get(workload).and_then(|e| e.min_total)
    }

    /// Number of readiness reads served.
    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }

    fn scale(state: &mut State, workload: &WorkloadId, replicas: u32, digest: &Digest) {
        let current = state
            .replicas
            .get(workload)
            .map(|rs| rs.iter().filter(|r| &r.digest == digest).count() as u32)
            .unwrap_or(0);

        if current > replicas {
            let mut surplus = current - replicas;
            let list = state.replicas.entry(workload.clone()).or_default();
            // Newest replicas go first.
            let mut i = list.len();
            while surplus > 0 && i > 0 {
                i -= 1;
                if &list[i].digest == digest {
                    list.remove(i);
                    surplus -= 1;
                }
            }
        } else {
            for _ in current..replicas {
                state.next_id += 1;
                let id = ReplicaId::new(format!("{}-{}", workload, state.next_id));
                state
                    .replicas
                    .entry(workload.clone())
                    .or_default()
                    .push(SimReplica {
                        id,
                        digest: digest.clone(),
                    });
            }
        }
    }
}

#[async_trait]
impl ClusterApply for SimulatedCluster {
    async fn set_workload(
        &self,
        workload: &WorkloadId,
        replicas: u32,
        artifact: &ArtifactRef,
    ) -> Result<(), ClusterError> {
        let delay = *self.apply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ClusterError::Operation {
                operation: "apply",
                workload: workload.clone(),
                message: "simulated transient failure".to_string(),
            });
        }
        if replicas > 0 && state.rejected.contains(artifact.digest()) {
            return Err(ClusterError::Rejected {
                workload: workload.clone(),
                message: format!("{} rejected", artifact.digest()),
            });
        }

        Self::scale(&mut state, workload, replicas, artifact.digest());
        state.applied.push(AppliedTarget {
            workload: workload.clone(),
            replicas,
            digest: artifact.digest().clone(),
        });

        let total = state.replicas.get(workload).map(|r| r.len()).unwrap_or(0) as u32;
        let extremes = state.extremes.entry(workload.clone()).or_default();
        extremes.max_total = extremes.max_total.max(total);
        extremes.min_total = Some(extremes.min_total.map_or(total, |m| m.min(total)));
        Ok(())
    }
}

#[async_trait]
impl ClusterRead for SimulatedCluster {
    async fn readiness_of(&self, workload: &WorkloadId) -> Result<Vec<ReplicaStatus>, ClusterError> {
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(state
            .replicas
            .get(workload)
            .into_iter()
            .flatten()
            .map(|r| ReplicaStatus {
                id: r.id.clone(),
                digest: r.digest.clone(),
                ready: !state.unready.contains(&r.digest),
                address: None,
            })
            .collect())
    }
}

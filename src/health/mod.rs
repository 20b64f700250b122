// ABOUTME: Health verification of a rollout step: probe replicas, classify, decide within a deadline.
// ABOUTME: Per-replica streak counters live for one verification window and are never persisted.

mod probe;

pub use probe::{
    ClusterProbe, ExecProbe, HttpProbe, Probe, ProbeError, TcpProbe, probe_for,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::{self, ClusterRead, ReplicaStatus};
use crate::config::{ReadinessCheck, VerifyConfig};
use crate::deploy::DeployError;
use crate::plan::RolloutStep;
use crate::types::{ReplicaId, WorkloadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaHealth {
    pub id: ReplicaId,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Outcome of one poll of a step.
#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub observed_at: DateTime<Utc>,
    /// Polls in a row in which every probed replica passed.
    pub consecutive_successes: u32,
    /// Polls in a row in which some probed replica failed.
    pub consecutive_failures: u32,
    pub healthy: u32,
    pub unhealthy: u32,
    pub replicas: Vec<ReplicaHealth>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    successes: u32,
    failures: u32,
}

/// Counters carried from one poll to the next while a single step is verified.
#[derive(Debug, Default)]
pub struct VerificationWindow {
    replicas: HashMap<ReplicaId, Streak>,
    clean_polls: u32,
    failing_polls: u32,
}

impl VerificationWindow {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct HealthVerifier {
    cluster: Arc<dyn ClusterRead>,
    config: VerifyConfig,
    call_timeout: Duration,
}

impl HealthVerifier {
    pub fn new(cluster: Arc<dyn ClusterRead>, config: VerifyConfig, call_timeout: Duration) -> Self {
        Self {
            cluster,
            config,
            call_timeout,
        }
    }

    /// Poll until `step` is decided or the verification deadline passes.
    ///
    /// `interrupted` is consulted before every poll; when it resolves to true
    /// the verification stops with `Aborted`.
    #[tracing::instrument(skip_all, fields(workload = %workload, step = step.index))]
    pub async fn verify<F, Fut>(
        &self,
        workload: &WorkloadId,
        readiness: &ReadinessCheck,
        step: &RolloutStep,
        mut interrupted: F,
    ) -> Result<HealthVerdict, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.config.timeout;
        let mut window = VerificationWindow::new();

        loop {
            if interrupted().await {
                return Err(DeployError::Aborted);
            }

            match self.poll(&mut window, workload, readiness, step).await {
                Ok(verdict) => match verdict.status {
                    HealthStatus::Healthy => return Ok(verdict),
                    HealthStatus::Unhealthy => {
                        return Err(DeployError::Unhealthy(format!(
                            "{} of {} replicas unhealthy, {} healthy, {} required",
                            verdict.unhealthy,
                            verdict.replicas.len(),
                            verdict.healthy,
                            step.abort.min_healthy
                        )));
                    }
                    HealthStatus::Unknown => {
                        debug!(healthy = verdict.healthy, unhealthy = verdict.unhealthy, "inconclusive");
                    }
                },
                Err(e) => warn!(error = %e, "readiness read failed, poll inconclusive"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::VerificationTimeout(self.config.timeout.as_secs()));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Probe every replica of the step's artifact once and classify.
    pub async fn poll(
        &self,
        window: &mut VerificationWindow,
        workload: &WorkloadId,
        readiness: &ReadinessCheck,
        step: &RolloutStep,
    ) -> Result<HealthVerdict, cluster::ClusterError> {
        let statuses = cluster::bounded(
            "readiness read",
            self.call_timeout,
            self.cluster.readiness_of(workload),
        )
        .await?;

        let candidates: Vec<ReplicaStatus> = statuses
            .into_iter()
            .filter(|r| &r.digest == step.artifact.digest())
            .collect();

        let probe = probe_for(&readiness.probe);
        let results = join_all(candidates.iter().map(|replica| {
            let probe = &probe;
            async move {
                match tokio::time::timeout(readiness.timeout, probe.check(replica)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout(readiness.timeout.as_millis())),
                }
            }
        }))
        .await;

        Ok(classify(window, readiness, step, &candidates, results))
    }
}

fn classify(
    window: &mut VerificationWindow,
    readiness: &ReadinessCheck,
    step: &RolloutStep,
    candidates: &[ReplicaStatus],
    results: Vec<Result<(), ProbeError>>,
) -> HealthVerdict {
    // Replicas that left the cluster take their streaks with them.
    window
        .replicas
        .retain(|id, _| candidates.iter().any(|c| &c.id == id));

    let mut replicas = Vec::with_capacity(candidates.len());
    let mut all_passed = true;

    for (replica, result) in candidates.iter().zip(results) {
        let streak = window.replicas.entry(replica.id.clone()).or_default();
        let last_error = match result {
            Ok(()) => {
                streak.successes += 1;
                streak.failures = 0;
                None
            }
            Err(e) => {
                streak.failures += 1;
                streak.successes = 0;
                all_passed = false;
                Some(e.to_string())
            }
        };

        let status = if streak.successes >= readiness.success_threshold {
            HealthStatus::Healthy
        } else if streak.failures >= readiness.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Unknown
        };

        replicas.push(ReplicaHealth {
            id: replica.id.clone(),
            status,
            consecutive_successes: streak.successes,
            consecutive_failures: streak.failures,
            last_error,
        });
    }

    if all_passed {
        window.clean_polls += 1;
        window.failing_polls = 0;
    } else {
        window.failing_polls += 1;
        window.clean_polls = 0;
    }

    let healthy = count(&replicas, HealthStatus::Healthy);
    let unhealthy = count(&replicas, HealthStatus::Unhealthy);
    let min_healthy = step.abort.min_healthy;

    // Replicas requested but not yet observed may still come up.
    let expected = step.verified_replicas().max(replicas.len() as u32);

    let status = if healthy >= min_healthy {
        HealthStatus::Healthy
    } else if expected.saturating_sub(unhealthy) < min_healthy {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Unknown
    };

    HealthVerdict {
        status,
        observed_at: Utc::now(),
        consecutive_successes: window.clean_polls,
        consecutive_failures: window.failing_polls,
        healthy,
        unhealthy,
        replicas,
    }
}

fn count(replicas: &[ReplicaHealth], status: HealthStatus) -> u32 {
    replicas.iter().filter(|r| r.status == status).count() as u32
}

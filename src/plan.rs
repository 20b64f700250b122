// ABOUTME: Rollout planning: turns current state, a target artifact, and a policy into steps.
// ABOUTME: Pure and deterministic; the same inputs always produce the same plan.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{ReadinessCheck, RolloutPolicy, Strategy};
use crate::deploy::DeployError;
use crate::types::{ArtifactRef, WorkloadId};

/// Desired state of a workload as known when a run is planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub workload: WorkloadId,
    /// Desired replica count.
    pub replicas: i32,
    /// Artifact the workload currently runs. `None` before the first deploy.
    pub artifact: Option<ArtifactRef>,
    pub readiness: ReadinessCheck,
}

/// Replica count for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaTarget {
    pub artifact: ArtifactRef,
    pub replicas: u32,
}

/// When verification of a step gives up.
///
/// The floor counts only replicas of the step's own artifact:
/// `max(min(new, desired - max_unavailable), min(new, 1))`. Replicas still
/// running the previous artifact are not checked during a step, so their
/// share of `desired - max_unavailable` is assumed.
/// The last step of a rollout creates every desired replica and its floor
/// is the full `desired - max_unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortCondition {
    /// Healthy replicas of the step's artifact required to pass.
    pub min_healthy: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStep {
    pub index: usize,
    /// Artifact whose replicas are verified after the step is applied.
    pub artifact: ArtifactRef,
    /// Applied in order.
    pub targets: Vec<ReplicaTarget>,
    /// Wait after this step verifies healthy, before the next one.
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
    pub abort: AbortCondition,
}

impl RolloutStep {
    /// Replicas requested for the step's own artifact.
    pub fn verified_replicas(&self) -> u32 {
        self.targets
            .iter()
            .filter(|t| t.artifact == self.artifact)
            .map(|t| t.replicas)
            .sum()
    }
}

/// Plan the move of `current` onto `target` under `policy`.
pub fn plan(
    current: &WorkloadSpec,
    target: &ArtifactRef,
    policy: &RolloutPolicy,
) -> Result<NonEmpty<RolloutStep>, DeployError> {
    let desired = desired_replicas(current)?;

    let steps = match policy.strategy {
        Strategy::RollingUpdate => {
            if policy.max_unavailable == 0 && policy.max_surge == 0 {
                return Err(DeployError::InvalidPolicy(
                    "max_unavailable and max_surge cannot both be zero".to_string(),
                ));
            }
            rolling_update(current, target, policy, desired)
        }
        Strategy::Recreate => recreate(current, target, policy, desired),
    };

    NonEmpty::from_vec(steps)
        .ok_or_else(|| DeployError::InvalidPolicy("plan has no steps".to_string()))
}

/// The single step that restores the artifact `current` was running.
///
/// On a first deploy there is nothing to restore, so the step only scales
/// `target` to zero.
pub fn rollback_step(
    current: &WorkloadSpec,
    target: &ArtifactRef,
    policy: &RolloutPolicy,
) -> Result<RolloutStep, DeployError> {
    let desired = desired_replicas(current)?;

    let step = match &current.artifact {
        Some(previous) if previous == target => RolloutStep {
            index: 0,
            artifact: previous.clone(),
            targets: vec![ReplicaTarget {
                artifact: previous.clone(),
                replicas: desired,
            }],
            pause: Duration::ZERO,
            abort: AbortCondition {
                min_healthy: min_healthy(desired, desired, policy.max_unavailable),
            },
        },
        Some(previous) => RolloutStep {
            index: 0,
            artifact: previous.clone(),
            targets: vec![
                ReplicaTarget {
                    artifact: previous.clone(),
                    replicas: desired,
                },
                ReplicaTarget {
                    artifact: target.clone(),
                    replicas: 0,
                },
            ],
            pause: Duration::ZERO,
            abort: AbortCondition {
                min_healthy: min_healthy(desired, desired, policy.max_unavailable),
            },
        },
        None => RolloutStep {
            index: 0,
            artifact: target.clone(),
            targets: vec![ReplicaTarget {
                artifact: target.clone(),
                replicas: 0,
            }],
            pause: Duration::ZERO,
            abort: AbortCondition { min_healthy: 0 },
        },
    };
    Ok(step)
}

fn desired_replicas(current: &WorkloadSpec) -> Result<u32, DeployError> {
    u32::try_from(current.replicas).map_err(|_| {
        DeployError::InvalidPolicy(format!(
            "desired replicas for {} cannot be negative ({})",
            current.workload, current.replicas
        ))
    })
}

/// Healthy target replicas a step needs: the availability floor, but never
/// more than the step creates and at least one when it creates any.
fn min_healthy(new_replicas: u32, desired: u32, max_unavailable: u32) -> u32 {
    let floor = new_replicas.min(desired.saturating_sub(max_unavailable));
    floor.max(new_replicas.min(1))
}

fn rolling_update(
    current: &WorkloadSpec,
    target: &ArtifactRef,
    policy: &RolloutPolicy,
    desired: u32,
) -> Vec<RolloutStep> {
    let previous = current.artifact.as_ref().filter(|a| *a != target);

    let Some(previous) = previous else {
        return vec![RolloutStep {
            index: 0,
            artifact: target.clone(),
            targets: vec![ReplicaTarget {
                artifact: target.clone(),
                replicas: desired,
            }],
            pause: policy.step_pause,
            abort: AbortCondition {
                min_healthy: min_healthy(desired, desired, policy.max_unavailable),
            },
        }];
    };

    if desired == 0 {
        return vec![RolloutStep {
            index: 0,
            artifact: target.clone(),
            targets: vec![
                ReplicaTarget {
                    artifact: previous.clone(),
                    replicas: 0,
                },
                ReplicaTarget {
                    artifact: target.clone(),
                    replicas: 0,
                },
            ],
            pause: policy.step_pause,
            abort: AbortCondition { min_healthy: 0 },
        }];
    }

    let surge = policy.max_surge;
    let mut old = desired;
    let mut new = 0u32;
    let mut steps = Vec::new();

    while old > 0 || new < desired {
        let next_old = desired
            .saturating_sub(policy.max_unavailable)
            .saturating_sub(new)
            .min(old);
        let next_new = desired.min(desired.saturating_add(surge).saturating_sub(next_old));

        // max_unavailable + max_surge >= 1 guarantees progress.
        debug_assert!(next_old < old || next_new > new);

        steps.push(RolloutStep {
            index: steps.len(),
            artifact: target.clone(),
            targets: vec![
                ReplicaTarget {
                    artifact: previous.clone(),
                    replicas: next_old,
                },
                ReplicaTarget {
                    artifact: target.clone(),
                    replicas: next_new,
                },
            ],
            pause: policy.step_pause,
            abort: AbortCondition {
                min_healthy: min_healthy(next_new, desired, policy.max_unavailable),
            },
        });

        old = next_old;
        new = next_new;
    }

    steps
}

fn recreate(
    current: &WorkloadSpec,
    target: &ArtifactRef,
    policy: &RolloutPolicy,
    desired: u32,
) -> Vec<RolloutStep> {
    let mut teardown = Vec::new();
    if let Some(previous) = current.artifact.as_ref().filter(|a| *a != target) {
        teardown.push(ReplicaTarget {
            artifact: previous.clone(),
            replicas: 0,
        });
    }
    teardown.push(ReplicaTarget {
        artifact: target.clone(),
        replicas: 0,
    });

    vec![
        RolloutStep {
            index: 0,
            artifact: target.clone(),
            targets: teardown,
            pause: policy.step_pause,
            abort: AbortCondition { min_healthy: 0 },
        },
        RolloutStep {
            index: 1,
            artifact: target.clone(),
            targets: vec![ReplicaTarget {
                artifact: target.clone(),
                replicas: desired,
            }],
            pause: policy.step_pause,
            abort: AbortCondition {
                min_healthy: min_healthy(desired, desired, policy.max_unavailable),
            },
        },
    ]
}

// ABOUTME: Drives one deployment run from Pending to a terminal state, persisting every change.
// ABOUTME: Applies planned steps, verifies them, rolls back on failure, and resumes after a crash.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cluster::{self, ClusterApply, ClusterError, ClusterRead};
use crate::config::{Config, RolloutPolicy, VerifyConfig};
use crate::health::HealthVerifier;
use crate::plan::{self, RolloutStep, WorkloadSpec};
use crate::retry::Backoff;
use crate::types::{ArtifactRef, Revision, RunId, WorkloadId};

use super::run::{DeploymentRun, RunState};
use super::store::RunStore;
use super::{DeployError, FailureReason};

/// Knobs the state machine reads from configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Policy used for new plans and to check resumed ones.
    pub policy: RolloutPolicy,
    pub verify: VerifyConfig,
    pub call_timeout: Duration,
    pub apply_backoff: Backoff,
}

impl MachineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.rollout.clone(),
            verify: config.verify.clone(),
            call_timeout: config.cluster.call_timeout,
            apply_backoff: config.cluster.apply_backoff(),
        }
    }
}

pub struct StateMachine {
    apply: Arc<dyn ClusterApply>,
    verifier: HealthVerifier,
    store: Arc<dyn RunStore>,
    config: MachineConfig,
}

impl StateMachine {
    pub fn new<C>(cluster: Arc<C>, store: Arc<dyn RunStore>, config: MachineConfig) -> Self
    where
        C: ClusterApply + ClusterRead + 'static,
    {
        let read: Arc<dyn ClusterRead> = cluster.clone();
        Self {
            apply: cluster,
            verifier: HealthVerifier::new(read, config.verify.clone(), config.call_timeout),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Plan a new run. Nothing is persisted or applied yet.
    pub fn prepare(
        &self,
        current: WorkloadSpec,
        revision: Revision,
        target: ArtifactRef,
    ) -> Result<DeploymentRun, DeployError> {
        let steps = plan::plan(&current, &target, &self.config.policy)?;
        Ok(DeploymentRun::new(
            revision,
            current,
            target,
            self.config.policy.clone(),
            steps,
        ))
    }

    /// Drive `run` to a terminal state.
    ///
    /// Rollbacks and failures are outcomes, not errors: they come back as
    /// `Ok` with the run in its terminal state. Errors are reserved for
    /// persistence failures and broken invariants.
    #[tracing::instrument(skip_all, fields(run = %run.id, workload = %run.workload))]
    pub async fn drive(&self, mut run: DeploymentRun) -> Result<DeploymentRun, DeployError> {
        self.store.save(&run).await?;

        while !run.is_terminal() {
            match run.state {
                RunState::Pending => {
                    if self.aborted(&run.id).await {
                        self.advance(&mut run, RunState::RollingBack, Some(&DeployError::Aborted))
                            .await?;
                    } else {
                        self.advance(&mut run, RunState::RollingOut, None).await?;
                    }
                }
                RunState::RollingOut => self.roll_out(&mut run).await?,
                RunState::Verifying => self.verify(&mut run).await?,
                RunState::RollingBack => self.roll_back(&mut run).await?,
                RunState::Succeeded | RunState::RolledBack | RunState::Failed => {}
            }
        }

        info!(state = %run.state, "run finished");
        Ok(run)
    }

    /// Continue a persisted run after a restart.
    ///
    /// The plan is recomputed from the recorded workload state and target
    /// with the configured policy. If it differs from the persisted plan the
    /// run is marked failed and `ConsistencyError` is returned.
    pub async fn resume(&self, id: &RunId) -> Result<DeploymentRun, DeployError> {
        let mut run = self.store.load(id).await?;
        if run.is_terminal() {
            return Ok(run);
        }

        if let Err(detail) = self.check_consistency(&run) {
            let err = DeployError::ConsistencyError {
                run: run.id.clone(),
                detail,
            };
            error!(run = %run.id, workload = %run.workload, "{err}");
            self.advance(&mut run, RunState::Failed, Some(&err)).await?;
            return Err(err);
        }

        info!(run = %run.id, state = %run.state, step = run.step_index, "resuming run");
        self.drive(run).await
    }

    /// Ask a running run to stop. The run rolls back at its next check.
    pub async fn abort(&self, id: &RunId) -> Result<(), DeployError> {
        request_abort(self.store.as_ref(), id).await
    }

    fn check_consistency(&self, run: &DeploymentRun) -> Result<(), String> {
        let steps = plan::plan(&run.current, &run.target, &self.config.policy)
            .map_err(|e| format!("plan can no longer be computed: {e}"))?;

        if steps.len() != run.steps.len() {
            return Err(format!(
                "recomputed plan has {} steps, persisted plan has {}",
                steps.len(),
                run.steps.len()
            ));
        }
        if let Some((index, _)) = steps
            .iter()
            .zip(run.steps.iter())
            .enumerate()
            .find(|(_, (fresh, stored))| fresh != stored)
        {
            return Err(format!("step {index} differs from the persisted plan"));
        }
        if run.step_index >= run.steps.len() {
            return Err(format!(
                "step index {} is past the end of the plan",
                run.step_index
            ));
        }
        Ok(())
    }

    async fn roll_out(&self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        if self.aborted(&run.id).await {
            return self
                .advance(run, RunState::RollingBack, Some(&DeployError::Aborted))
                .await;
        }

        let step = self.step(run)?;
        info!(step = step.index, of = run.steps.len(), "applying step");
        match self.apply_step(&run.workload, &step).await {
            Ok(()) => self.advance(run, RunState::Verifying, None).await,
            Err(e) => {
                warn!(step = step.index, error = %e, "apply failed, rolling back");
                self.advance(run, RunState::RollingBack, Some(&e)).await
            }
        }
    }

    async fn verify(&self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        let step = self.step(run)?;
        let outcome = self
            .verifier
            .verify(&run.workload, &run.current.readiness, &step, || {
                self.aborted(&run.id)
            })
            .await;

        match outcome {
            Ok(verdict) if run.is_last_step() => {
                info!(healthy = verdict.healthy, "final step healthy");
                self.advance(run, RunState::Succeeded, None).await
            }
            Ok(verdict) => {
                info!(step = step.index, healthy = verdict.healthy, "step healthy");
                self.advance(run, RunState::RollingOut, None).await?;
                run.step_index += 1;
                self.store.save(run).await?;
                if !step.pause.is_zero() {
                    tokio::time::sleep(step.pause).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(step = step.index, error = %e, "verification failed, rolling back");
                self.advance(run, RunState::RollingBack, Some(&e)).await
            }
        }
    }

    async fn roll_back(&self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        let step = plan::rollback_step(&run.current, &run.target, &run.policy)?;
        info!(restoring = ?run.previous.as_ref().map(|a| a.pinned()), "rolling back");

        let outcome = match self.apply_step(&run.workload, &step).await {
            Ok(()) => self
                .verifier
                .verify(&run.workload, &run.current.readiness, &step, || async { false })
                .await
                .map(drop),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => self.advance(run, RunState::RolledBack, None).await,
            Err(e) => {
                let err = DeployError::RollbackFailed(e.to_string());
                error!(run = %run.id, workload = %run.workload, "{err}");
                self.advance(run, RunState::Failed, Some(&err)).await
            }
        }
    }

    /// Apply every target of `step` in order, retrying transient failures.
    async fn apply_step(&self, workload: &WorkloadId, step: &RolloutStep) -> Result<(), DeployError> {
        for target in &step.targets {
            self.config
                .apply_backoff
                .retry("cluster apply", ClusterError::is_transient, || {
                    cluster::bounded(
                        "apply",
                        self.config.call_timeout,
                        self.apply
                            .set_workload(workload, target.replicas, &target.artifact),
                    )
                })
                .await?;
        }
        Ok(())
    }

    fn step(&self, run: &DeploymentRun) -> Result<RolloutStep, DeployError> {
        run.current_step()
            .cloned()
            .ok_or_else(|| DeployError::ConsistencyError {
                run: run.id.clone(),
                detail: format!("no step at index {}", run.step_index),
            })
    }

    async fn advance(
        &self,
        run: &mut DeploymentRun,
        next: RunState,
        cause: Option<&DeployError>,
    ) -> Result<(), DeployError> {
        let from = run.state;
        run.transition(next, cause.map(FailureReason::from))?;
        info!(run = %run.id, %from, to = %next, step = run.step_index, "run state changed");
        self.store.save(run).await?;
        Ok(())
    }

    async fn aborted(&self, id: &RunId) -> bool {
        match self.store.abort_requested(id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(run = %id, error = %e, "cannot read abort marker");
                false
            }
        }
    }
}

/// Leave an abort request for the process driving run `id`.
///
/// Terminal runs cannot be aborted and report `RunFinished`.
pub async fn request_abort(store: &dyn RunStore, id: &RunId) -> Result<(), DeployError> {
    let run = store.load(id).await?;
    if run.is_terminal() {
        return Err(DeployError::RunFinished {
            run: id.clone(),
            state: run.state.to_string(),
        });
    }
    store.request_abort(id).await?;
    info!(run = %id, "abort requested");
    Ok(())
}

// ABOUTME: Pipeline coordinator: turns push events into deployment runs, one workload at a time.
// ABOUTME: Gates on tests and hooks, resolves artifacts, queues busy workloads, and recovers runs.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cluster::{ClusterApply, ClusterRead};
use crate::config::{Config, CoordinatorConfig, WorkloadConfig};
use crate::deploy::{
    DeployError, DeployErrorKind, DeploymentRun, FailureReason, LockHolderInfo, MachineConfig,
    Rejection, RunState, RunStore, StateMachine, StoreError, WorkloadLock, WorkloadLocks,
    holder_is_dead, settled_artifact,
};
use crate::hooks::{HookContext, HookPoint, HookRunner};
use crate::plan::WorkloadSpec;
use crate::registry::RegistryLookup;
use crate::resolve::Resolver;
use crate::types::{ArtifactRef, Revision, RunId, WorkloadId};

/// A source-control push announcing a new revision of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub workload: WorkloadId,
    pub revision: Revision,
    /// Outcome of the pipeline's test stage, when it reported one.
    #[serde(default)]
    pub tests_passed: Option<bool>,
}

impl PushEvent {
    pub fn new(workload: WorkloadId, revision: Revision) -> Self {
        Self {
            workload,
            revision,
            tests_passed: None,
        }
    }

    pub fn with_tests(mut self, passed: bool) -> Self {
        self.tests_passed = Some(passed);
        self
    }
}

/// Per-workload admission state. `active` is set while some task of this
/// process owns the workload; `queue` holds pushes that arrived meanwhile.
#[derive(Debug, Default)]
struct Slot {
    active: bool,
    queue: VecDeque<PushEvent>,
}

pub struct Coordinator {
    settings: CoordinatorConfig,
    workloads: Vec<WorkloadConfig>,
    resolver: Resolver,
    machine: StateMachine,
    locks: WorkloadLocks,
    hooks: Option<HookRunner>,
    slots: Mutex<HashMap<WorkloadId, Slot>>,
}

impl Coordinator {
    pub fn new<C>(
        config: &Config,
        registry: Arc<dyn RegistryLookup>,
        cluster: Arc<C>,
        store: Arc<dyn RunStore>,
        locks: WorkloadLocks,
    ) -> Self
    where
        C: ClusterApply + ClusterRead + 'static,
    {
        Self {
            settings: config.coordinator.clone(),
            workloads: config.workloads.iter().cloned().collect(),
            resolver: Resolver::new(registry, &config.registry),
            machine: StateMachine::new(cluster, store, MachineConfig::from_config(config)),
            locks,
            hooks: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.machine.store()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Pushes waiting behind the active run of `workload`.
    pub fn queued(&self, workload: &WorkloadId) -> Vec<PushEvent> {
        self.slots
            .lock()
            .get(workload)
            .map(|slot| slot.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn workload(&self, id: &WorkloadId) -> Result<&WorkloadConfig, DeployError> {
        self.workloads
            .iter()
            .find(|w| &w.id == id)
            .ok_or_else(|| DeployError::UnknownWorkload(id.clone()))
    }

    /// Handle one push event.
    ///
    /// Returns the run the push produced, driven to a terminal state. When
    /// another run owns the workload the push is queued and
    /// `DeploymentInProgress` is returned; queued pushes are handled, in
    /// arrival order, by the call that owns the workload before it returns.
    #[tracing::instrument(skip_all, fields(workload = %event.workload, revision = %event.revision))]
    pub async fn submit(&self, event: PushEvent) -> Result<DeploymentRun, DeployError> {
        self.workload(&event.workload)?;

        let workload = event.workload.clone();
        if !self.claim(&workload, Some(&event)) {
            let holder = self.locks.holder(&workload).ok().flatten();
            info!("workload busy, push queued");
            return Err(DeployError::DeploymentInProgress { workload, holder });
        }

        let result = self.process(event).await;
        self.drain(&workload).await;
        result
    }

    /// Take ownership of `workload` for this task. When it is already owned,
    /// `event` (if any) is queued and false is returned.
    fn claim(&self, workload: &WorkloadId, event: Option<&PushEvent>) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.entry(workload.clone()).or_default();
        if slot.active {
            if let Some(event) = event {
                slot.queue.push_back(event.clone());
            }
            return false;
        }
        slot.active = true;
        true
    }

    /// Handle queued pushes until none are left, then give up ownership.
    async fn drain(&self, workload: &WorkloadId) {
        loop {
            let next = {
                let mut slots = self.slots.lock();
                let slot = slots.entry(workload.clone()).or_default();
                match slot.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        slot.active = false;
                        return;
                    }
                }
            };

            info!(%workload, revision = %next.revision, "processing queued push");
            match self.process(next).await {
                Ok(run) => info!(%workload, run = %run.id, state = %run.state, "queued push finished"),
                Err(e) => warn!(%workload, error = %e, "queued push did not deploy"),
            }
        }
    }

    async fn process(&self, event: PushEvent) -> Result<DeploymentRun, DeployError> {
        let config = self.workload(&event.workload)?;

        if self.settings.require_tests && event.tests_passed != Some(true) {
            let err = DeployError::TestsFailed(event.revision.to_string());
            return Err(self.reject(&event, err).await);
        }

        let mut context = HookContext::new(event.workload.clone(), event.revision.clone());
        if let Some(hooks) = &self.hooks
            && let Some(result) = hooks.run(HookPoint::PreDeploy, &context).await
            && !result.success
        {
            let err = DeployError::HookFailed(format!(
                "pre-deploy exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
            return Err(self.reject(&event, err).await);
        }

        let target = match self.resolve(config, &event.revision).await {
            Ok(target) => target,
            Err(e) => return Err(self.reject(&event, e).await),
        };
        context.artifact = Some(target.pinned());

        let current = match self.current_spec(config).await {
            Ok(current) => current,
            Err(e) => return Err(self.reject(&event, e).await),
        };
        let run = match self.machine.prepare(current, event.revision.clone(), target) {
            Ok(run) => run,
            Err(e) => return Err(self.reject(&event, e).await),
        };
        context.run = Some(run.id.clone());

        // A lock held by another process is refused, not queued: the queue
        // only spans this process.
        let lock = match self.acquire(&run.workload, &run.id).await {
            Ok(lock) => lock,
            Err(e) => return Err(self.reject(&event, e).await),
        };
        info!(run = %run.id, steps = run.steps.len(), target = %run.target.pinned(), "starting run");
        let outcome = self.machine.drive(run).await;
        drop(lock);

        let run = match outcome {
            Ok(run) => run,
            Err(e) => return Err(self.reject(&event, e).await),
        };
        self.after_run(&run, context).await;
        Ok(run)
    }

    /// Resolve, re-queueing revisions whose artifact is not built yet.
    async fn resolve(
        &self,
        config: &WorkloadConfig,
        revision: &Revision,
    ) -> Result<ArtifactRef, DeployError> {
        self.settings
            .not_built_backoff()
            .retry(
                "artifact resolution",
                |e: &DeployError| e.kind() == DeployErrorKind::NotBuilt,
                || self.resolver.resolve(config, revision),
            )
            .await
    }

    /// Desired state as of the last settled run.
    async fn current_spec(&self, config: &WorkloadConfig) -> Result<WorkloadSpec, DeployError> {
        let runs = self.store().for_workload(&config.id).await?;
        Ok(WorkloadSpec {
            workload: config.id.clone(),
            replicas: config.replicas,
            artifact: settled_artifact(&runs),
            readiness: config.readiness.clone(),
        })
    }

    /// Take the workload lock, breaking it if its holder is provably done.
    async fn acquire(&self, workload: &WorkloadId, run: &RunId) -> Result<WorkloadLock, DeployError> {
        match self.locks.acquire(workload, run) {
            Err(DeployError::DeploymentInProgress {
                holder: Some(holder),
                ..
            }) if self.is_stale(&holder).await => {
                self.locks.break_lock(workload)?;
                self.locks.acquire(workload, run)
            }
            other => other,
        }
    }

    /// A lock is stale once its run is terminal. A lock naming a run the
    /// store has never seen is stale only when its process is gone, since
    /// the holder saves the run just after taking the lock.
    async fn is_stale(&self, holder: &LockHolderInfo) -> bool {
        match self.store().load(&holder.run).await {
            Ok(existing) => existing.is_terminal(),
            Err(StoreError::NotFound(_)) => holder_is_dead(holder),
            Err(e) => {
                warn!(run = %holder.run, error = %e, "cannot check lock holder");
                false
            }
        }
    }

    /// Record a push that never became a run and hand the error back.
    async fn reject(&self, event: &PushEvent, err: DeployError) -> DeployError {
        warn!(workload = %event.workload, revision = %event.revision, error = %err, "push rejected");
        let rejection = Rejection::new(
            event.workload.clone(),
            event.revision.clone(),
            FailureReason::from(&err),
        );
        if let Err(e) = self.store().record_rejection(&rejection).await {
            error!(error = %e, "failed to record rejection");
        }
        err
    }

    async fn after_run(&self, run: &DeploymentRun, mut context: HookContext) {
        let Some(hooks) = &self.hooks else {
            return;
        };
        context.state = Some(run.state.to_string());
        context.failure = run.failure.as_ref().map(ToString::to_string);

        let point = if run.state == RunState::Succeeded {
            HookPoint::PostDeploy
        } else {
            HookPoint::OnFailure
        };
        if let Some(result) = hooks.run(point, &context).await
            && !result.success
        {
            warn!(run = %run.id, "{} hook failed: {}", point.filename(), result.stderr.trim());
        }
    }

    /// Resume every non-terminal run left behind by a previous process.
    ///
    /// Runs of different workloads resume concurrently. Each result pairs
    /// the run id with its outcome.
    pub async fn recover(&self) -> Result<Vec<(RunId, Result<DeploymentRun, DeployError>)>, DeployError> {
        let pending = self.store().non_terminal().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!(runs = pending.len(), "recovering interrupted runs");

        let outcomes = join_all(pending.into_iter().map(|run| async move {
            let outcome = self.recover_one(&run).await;
            (run.id, outcome)
        }))
        .await;
        Ok(outcomes)
    }

    async fn recover_one(&self, run: &DeploymentRun) -> Result<DeploymentRun, DeployError> {
        if !self.claim(&run.workload, None) {
            return Err(DeployError::DeploymentInProgress {
                workload: run.workload.clone(),
                holder: self.locks.holder(&run.workload).ok().flatten(),
            });
        }

        let outcome = async {
            let lock = self.locks.adopt(&run.workload, &run.id)?;
            let outcome = self.machine.resume(&run.id).await;
            drop(lock);
            outcome
        }
        .await;

        if let Ok(finished) = &outcome {
            let mut context = HookContext::new(finished.workload.clone(), finished.revision.clone());
            context.artifact = Some(finished.target.pinned());
            context.run = Some(finished.id.clone());
            self.after_run(finished, context).await;
        }

        self.drain(&run.workload).await;
        outcome
    }

    /// Resolve and plan `event` without touching the cluster or the store.
    pub async fn preview(&self, event: &PushEvent) -> Result<DeploymentRun, DeployError> {
        let config = self.workload(&event.workload)?;
        let target = self.resolver.resolve(config, &event.revision).await?;
        let current = self.current_spec(config).await?;
        self.machine.prepare(current, event.revision.clone(), target)
    }
}

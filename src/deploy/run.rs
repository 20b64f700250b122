// ABOUTME: The persisted record of one deployment attempt and its state graph.
// ABOUTME: Only the state machine mutates a run; every change is kept in its history.

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RolloutPolicy;
use crate::plan::{RolloutStep, WorkloadSpec};
use crate::types::{ArtifactRef, Revision, RunId, WorkloadId};

use super::{DeployError, FailureReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Pending,
    RollingOut,
    Verifying,
    Succeeded,
    RollingBack,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::RolledBack | RunState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::RollingOut => "rolling-out",
            RunState::Verifying => "verifying",
            RunState::Succeeded => "succeeded",
            RunState::RollingBack => "rolling-back",
            RunState::RolledBack => "rolled-back",
            RunState::Failed => "failed",
        }
    }

    /// Edges of the run state graph.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Pending, RollingOut) | (Pending, RollingBack) => true,
            (RollingOut, Verifying) | (RollingOut, RollingBack) => true,
            (Verifying, RollingOut) | (Verifying, Succeeded) | (Verifying, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: RunState,
    pub to: RunState,
    pub step_index: usize,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: RunId,
    pub workload: WorkloadId,
    pub revision: Revision,
    pub target: ArtifactRef,
    /// Artifact restored on rollback. `None` for a first deploy.
    pub previous: Option<ArtifactRef>,
    /// Workload state the plan was computed from.
    pub current: WorkloadSpec,
    pub policy: RolloutPolicy,
    pub steps: NonEmpty<RolloutStep>,
    pub step_index: usize,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub history: Vec<StateChange>,
}

impl DeploymentRun {
    pub fn new(
        revision: Revision,
        current: WorkloadSpec,
        target: ArtifactRef,
        policy: RolloutPolicy,
        steps: NonEmpty<RolloutStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            workload: current.workload.clone(),
            revision,
            previous: current.artifact.clone(),
            target,
            current,
            policy,
            steps,
            step_index: 0,
            state: RunState::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            failure: None,
            history: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current_step(&self) -> Option<&RolloutStep> {
        self.steps.get(self.step_index)
    }

    pub fn is_last_step(&self) -> bool {
        self.step_index + 1 >= self.steps.len()
    }

    /// Move to `next`, recording the change. A reason replaces any earlier
    /// failure reason.
    pub fn transition(
        &mut self,
        next: RunState,
        reason: Option<FailureReason>,
    ) -> Result<(), DeployError> {
        if !self.state.can_transition_to(next) {
            return Err(DeployError::ConsistencyError {
                run: self.id.clone(),
                detail: format!("illegal transition {} -> {}", self.state, next),
            });
        }

        let now = Utc::now();
        self.history.push(StateChange {
            from: self.state,
            to: next,
            step_index: self.step_index,
            at: now,
            reason: reason.clone(),
        });
        if reason.is_some() {
            self.failure = reason;
        }
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            id: self.id.clone(),
            workload: self.workload.clone(),
            revision: self.revision.clone(),
            target: self.target.pinned(),
            state: self.state,
            step_index: self.step_index,
            steps: self.steps.len(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only summary of a run, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub id: RunId,
    pub workload: WorkloadId,
    pub revision: Revision,
    pub target: String,
    pub state: RunState,
    pub step_index: usize,
    pub steps: usize,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The artifact a workload last settled on, judging by its runs.
///
/// `runs` must be ordered oldest first. Failed runs are skipped since they
/// leave no trustworthy record of what is running.
pub fn settled_artifact(runs: &[DeploymentRun]) -> Option<ArtifactRef> {
    runs.iter().rev().find_map(|run| match run.state {
        RunState::Succeeded => Some(Some(run.target.clone())),
        RunState::RolledBack => Some(run.previous.clone()),
        _ => None,
    })?
}

// ABOUTME: Rollout, verification, and coordinator policy configuration.
// ABOUTME: Strategy selection, batch sizing limits, poll cadence, and retry budgets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::Backoff;

/// How replicas move from the previous artifact to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Replace replicas in batches bounded by `max_unavailable` and `max_surge`.
    #[default]
    RollingUpdate,
    /// Scale to zero, then to the full count on the new artifact.
    /// Causes a deliberate availability gap.
    Recreate,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RollingUpdate => "rolling-update",
            Strategy::Recreate => "recreate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,

    #[serde(default)]
    pub max_surge: u32,

    #[serde(default = "default_step_pause", with = "humantime_serde")]
    pub step_pause: Duration,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        RolloutPolicy {
            strategy: Strategy::default(),
            max_unavailable: default_max_unavailable(),
            max_surge: 0,
            step_pause: default_step_pause(),
        }
    }
}

fn default_max_unavailable() -> u32 {
    1
}

fn default_step_pause() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_verify_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            poll_interval: default_poll_interval(),
            timeout: default_verify_timeout(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_verify_timeout() -> Duration {
    Duration::from_secs(120)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinatorConfig {
    /// Re-queue attempts for a revision whose artifact is not built yet.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Refuse pushes whose test result is not a pass.
    #[serde(default)]
    pub require_tests: bool,
}

impl CoordinatorConfig {
    pub fn not_built_backoff(&self) -> Backoff {
        Backoff::new(self.max_retries, self.backoff_base)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            require_tests: false,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(5)
}

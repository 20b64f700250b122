// ABOUTME: Readiness check configuration for workload replicas.
// ABOUTME: Protocol-polymorphic probe descriptor plus threshold classification settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a single replica is probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// HTTP GET against the replica; any 2xx or 3xx status is a success.
    Http {
        path: String,
        port: u16,
    },
    /// TCP connect to the replica; an established connection is a success.
    Tcp { port: u16 },
    /// Run a command on the orchestrator host; exit status 0 is a success.
    /// `CONVEYOR_REPLICA_ID` and `CONVEYOR_REPLICA_ADDR` are set for it.
    Exec { command: Vec<String> },
    /// Trust the cluster's own readiness flag for the replica.
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub probe: ProbeSpec,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        ReadinessCheck {
            probe: ProbeSpec::Cluster,
            timeout: default_timeout(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_success_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

// ABOUTME: Configuration types and parsing for conveyor.yml.
// ABOUTME: Handles YAML parsing, discovery, defaults, and cross-field validation.

mod deserialize;
mod env_value;
mod init;
mod readiness;
mod rollout;
mod workload;

pub use env_value::{EnvValue, resolve_env_pairs, resolve_optional};
pub use init::init_config;
pub use readiness::{ProbeSpec, ReadinessCheck};
pub use rollout::{CoordinatorConfig, RolloutPolicy, Strategy, VerifyConfig};
pub use workload::WorkloadConfig;

use crate::error::{Error, Result};
use crate::retry::Backoff;
use crate::types::WorkloadId;
use deserialize::deserialize_workloads;
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "conveyor.yml";
pub const CONFIG_FILENAME_ALT: &str = "conveyor.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".conveyor/config.yml";

/// State directory used when `state_dir` is not configured, relative to the
/// platform state (or home) directory.
const DEFAULT_STATE_SUBDIR: &str = "conveyor";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_workloads")]
    pub workloads: NonEmpty<WorkloadConfig>,

    #[serde(default)]
    pub rollout: RolloutPolicy,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Engine socket. Local defaults are used when unset.
    #[serde(default)]
    pub socket: Option<String>,

    /// Network replicas are attached to.
    #[serde(default)]
    pub network: Option<String>,

    /// Upper bound on any single apply or read call.
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    #[serde(default = "default_apply_retries")]
    pub apply_retries: u32,

    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub apply_backoff: Duration,
}

impl ClusterConfig {
    pub fn apply_backoff(&self) -> Backoff {
        Backoff::new(self.apply_retries, self.apply_backoff)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            socket: None,
            network: None,
            call_timeout: default_call_timeout(),
            apply_retries: default_apply_retries(),
            apply_backoff: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Upper bound on a single digest lookup.
    #[serde(default = "default_registry_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Local retries when the registry is unreachable.
    #[serde(default = "default_registry_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    #[serde(default)]
    pub username: Option<EnvValue>,

    #[serde(default)]
    pub password: Option<EnvValue>,
}

impl RegistryConfig {
    pub fn unavailable_backoff(&self) -> Backoff {
        Backoff::new(self.retries, self.backoff)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            timeout: default_registry_timeout(),
            retries: default_registry_retries(),
            backoff: default_retry_backoff(),
            username: None,
            password: None,
        }
    }
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_apply_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_registry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_registry_retries() -> u32 {
    3
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    /// Checks that serde cannot express on its own.
    fn validate(&self) -> Result<()> {
        for workload in &self.workloads {
            let readiness = &workload.readiness;
            if readiness.success_threshold == 0 || readiness.failure_threshold == 0 {
                return Err(Error::InvalidConfig(format!(
                    "workload {}: readiness thresholds must be at least 1",
                    workload.id
                )));
            }
            if let ProbeSpec::Exec { command } = &readiness.probe
                && command.is_empty()
            {
                return Err(Error::InvalidConfig(format!(
                    "workload {}: exec probe needs a command",
                    workload.id
                )));
            }
        }
        if self.verify.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "verify.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn workload(&self, id: &WorkloadId) -> Result<&WorkloadConfig> {
        self.workloads
            .iter()
            .find(|w| &w.id == id)
            .ok_or_else(|| Error::UnknownWorkload(id.to_string()))
    }

    /// Directory holding run records, lock files, and the rejection log.
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        dirs::state_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
            .map(|base| base.join(DEFAULT_STATE_SUBDIR))
            .ok_or_else(|| Error::InvalidConfig("cannot determine a state directory".to_string()))
    }

    pub fn template() -> Self {
        Config {
            workloads: NonEmpty::new(WorkloadConfig {
                id: WorkloadId::new("web").expect("template workload id is valid"),
                repository: "registry.example.com/org/web".to_string(),
                replicas: 3,
                tag: "{commit}".to_string(),
                readiness: ReadinessCheck {
                    probe: ProbeSpec::Http {
                        path: "/healthz".to_string(),
                        port: 8080,
                    },
                    ..ReadinessCheck::default()
                },
                env: HashMap::new(),
            }),
            rollout: RolloutPolicy::default(),
            verify: VerifyConfig::default(),
            coordinator: CoordinatorConfig::default(),
            cluster: ClusterConfig::default(),
            registry: RegistryConfig::default(),
            state_dir: None,
        }
    }
}

fn validate_template_repository(repository: &str) -> Result<()> {
    crate::types::validate_repository(repository).map_err(|e| Error::InvalidConfig(e.to_string()))
}

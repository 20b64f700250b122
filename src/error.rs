// ABOUTME: Application-wide error types for conveyor.
// ABOUTME: Uses thiserror for ergonomic error handling.

use std::path::PathBuf;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::deploy::{DeployError, StoreError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("run {run} ended {state}: {reason}")]
    RunFailed {
        run: String,
        state: String,
        reason: String,
    },

    #[error("{0} interrupted run(s) could not be resumed")]
    ResumeFailed(usize),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ABOUTME: Maps a source revision to the content-addressed artifact built from it.
// ABOUTME: Pure registry lookup with bounded local retries when the registry is unreachable.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{RegistryConfig, WorkloadConfig};
use crate::deploy::DeployError;
use crate::registry::{RegistryError, RegistryLookup};
use crate::retry::Backoff;
use crate::types::{ArtifactRef, Revision};

#[derive(Clone)]
pub struct Resolver {
    registry: Arc<dyn RegistryLookup>,
    timeout: Duration,
    backoff: Backoff,
}

impl Resolver {
    pub fn new(registry: Arc<dyn RegistryLookup>, config: &RegistryConfig) -> Self {
        Self {
            registry,
            timeout: config.timeout,
            backoff: config.unavailable_backoff(),
        }
    }

    /// Resolve `revision` to the artifact published for `workload`.
    ///
    /// Returns `NotBuilt` when the registry has no such tag and
    /// `RegistryUnavailable` once local retries are spent. Never mutates
    /// the registry, so calling it repeatedly is safe.
    pub async fn resolve(
        &self,
        workload: &WorkloadConfig,
        revision: &Revision,
    ) -> Result<ArtifactRef, DeployError> {
        let tag = workload.tag_for(revision);
        let repository = workload.repository.as_str();

        let digest = self
            .backoff
            .retry("registry lookup", RegistryError::is_transient, || {
                self.lookup(repository, &tag)
            })
            .await
            .map_err(|e| match e {
                RegistryError::NotFound { .. } => DeployError::NotBuilt {
                    revision: revision.to_string(),
                    repository: repository.to_string(),
                    tag: tag.clone(),
                },
                other => DeployError::from(other),
            })?;

        debug!(workload = %workload.id, %tag, %digest, "resolved artifact");

        ArtifactRef::new(repository, &tag, digest)
            .map_err(|e| DeployError::RegistryUnavailable(e.to_string()))
    }

    async fn lookup(&self, repository: &str, tag: &str) -> Result<crate::types::Digest, RegistryError> {
        match tokio::time::timeout(self.timeout, self.registry.digest_for(repository, tag)).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Unavailable(format!(
                "lookup of {repository}:{tag} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

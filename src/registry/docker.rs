// ABOUTME: Registry lookup through a Docker-compatible engine's distribution endpoint.
// ABOUTME: The engine talks to the registry (TLS, auth), so no registry client lives here.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;

use super::{RegistryError, RegistryLookup};
use crate::types::Digest;

/// Resolves tags by asking the engine to inspect the remote manifest.
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    client: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerRegistry {
    pub fn new(client: Docker) -> Self {
        Self {
            client,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        });
        self
    }
}

#[async_trait]
impl RegistryLookup for DockerRegistry {
    async fn digest_for(&self, repository: &str, tag: &str) -> Result<Digest, RegistryError> {
        let reference = format!("{repository}:{tag}");

        let inspect = self
            .client
            .inspect_registry_image(&reference, self.credentials.clone())
            .await
            .map_err(|e| map_lookup_error(e, repository, tag))?;

        let digest = inspect
            .descriptor
            .digest
            .ok_or_else(|| RegistryError::InvalidDigest(format!("{reference}: no digest")))?;

        Digest::parse(&digest).map_err(|e| RegistryError::InvalidDigest(e.to_string()))
    }
}

/// Registries answer 401/403 for repositories the caller cannot see, which
/// for a lookup is indistinguishable from "not pushed yet".
fn map_lookup_error(e: bollard::errors::Error, repository: &str, tag: &str) -> RegistryError {
    match &e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if matches!(*status_code, 401 | 403 | 404) =>
        {
            RegistryError::NotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            }
        }
        _ => RegistryError::Unavailable(e.to_string()),
    }
}

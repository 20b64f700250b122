// ABOUTME: Registry lookup capability: resolve a repository tag to a content digest.
// ABOUTME: Engine-backed implementation plus an in-memory registry for tests and dry runs.

mod docker;

pub use docker::DockerRegistry;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::types::Digest;

/// Pure lookup against an image registry. Never builds or pushes.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    /// Digest currently published under `repository:tag`.
    async fn digest_for(&self, repository: &str, tag: &str) -> Result<Digest, RegistryError>;
}

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{repository}:{tag} not found")]
    NotFound { repository: String, tag: String },

    #[error("registry unreachable: {0}")]
    Unavailable(String),

    #[error("registry returned an unusable digest: {0}")]
    InvalidDigest(String),
}

impl RegistryError {
    /// Worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

/// Registry held in memory. Lookups can be switched to fail as unreachable.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    tags: Arc<RwLock<HashMap<(String, String), Digest>>>,
    unavailable: Arc<AtomicBool>,
    lookups: Arc<AtomicU32>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `digest` under `repository:tag`, replacing any previous digest.
    pub fn publish(&self, repository: &str, tag: &str, digest: Digest) {
        self.tags
            .write()
            .insert((repository.to_string(), tag.to_string()), digest);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of lookups served so far, failed ones included.
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryLookup for StaticRegistry {
    async fn digest_for(&self, repository: &str, tag: &str) -> Result<Digest, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry marked down".to_string()));
        }
        self.tags
            .read()
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            })
    }
}

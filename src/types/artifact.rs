// ABOUTME: Source revisions and content-addressed artifact references.
// ABOUTME: Digest is the identity of an artifact; tags are mutable metadata.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("repository cannot be empty")]
    EmptyRepository,

    #[error("invalid character in repository: {0}")]
    InvalidRepositoryChar(char),

    #[error("tag cannot be empty")]
    EmptyTag,

    #[error("invalid character in tag: {0}")]
    InvalidTagChar(char),

    #[error("digest must have the form <algorithm>:<hex>: {0}")]
    InvalidDigest(String),
}

/// A source-control commit observed on a branch. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub commit: String,
    pub branch: String,
}

impl Revision {
    pub fn new(commit: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            branch: branch.into(),
        }
    }

    /// First seven characters of the commit, the conventional short form.
    pub fn short(&self) -> &str {
        match self.commit.char_indices().nth(7) {
            Some((idx, _)) => &self.commit[..idx],
            None => &self.commit,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.short())
    }
}

/// Content digest such as `sha256:9f86d0…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn parse(input: &str) -> Result<Self, ArtifactError> {
        let input = input.trim();
        let (algorithm, hex) = input
            .split_once(':')
            .ok_or_else(|| ArtifactError::InvalidDigest(input.to_string()))?;

        let algorithm_ok = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '.');
        let hex_ok = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());

        if !algorithm_ok || !hex_ok {
            return Err(ArtifactError::InvalidDigest(input.to_string()));
        }

        Ok(Self(input.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after `algorithm:`.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
    }

    /// Twelve hex characters, enough to tell artifacts apart in logs.
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Registry coordinates of a built artifact.
///
/// Equality and hashing consider only the digest: two references with the
/// same digest are the same artifact regardless of which tag found them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    repository: String,
    tag: String,
    digest: Digest,
}

impl ArtifactRef {
    pub fn new(repository: &str, tag: &str, digest: Digest) -> Result<Self, ArtifactError> {
        validate_repository(repository)?;
        validate_tag(tag)?;
        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Reference that pins the exact content, suitable for pulling.
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }
}

impl PartialEq for ArtifactRef {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for ArtifactRef {}

impl Hash for ArtifactRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.repository, self.tag, self.digest)
    }
}

pub(crate) fn validate_repository(input: &str) -> Result<(), ArtifactError> {
    if input.trim().is_empty() {
        return Err(ArtifactError::EmptyRepository);
    }
    for c in input.chars() {
        if !c.is_ascii_alphanumeric() && c != '/' && c != ':' && c != '.' && c != '-' && c != '_'
        {
            return Err(ArtifactError::InvalidRepositoryChar(c));
        }
    }
    Ok(())
}

fn validate_tag(input: &str) -> Result<(), ArtifactError> {
    if input.is_empty() {
        return Err(ArtifactError::EmptyTag);
    }
    for c in input.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(ArtifactError::InvalidTagChar(c));
        }
    }
    Ok(())
}

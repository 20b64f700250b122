// ABOUTME: Per-workload configuration: repository, desired replicas, tag scheme, readiness.
// ABOUTME: Maps a source revision to the registry tag the build pipeline pushed.

use serde::Deserialize;
use std::collections::HashMap;

use crate::types::{Revision, WorkloadId};

use super::deserialize::deserialize_repository;
use super::{EnvValue, ReadinessCheck};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    pub id: WorkloadId,

    #[serde(deserialize_with = "deserialize_repository")]
    pub repository: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Tag template. Recognised placeholders: `{commit}`, `{short}`, `{branch}`.
    #[serde(default = "default_tag")]
    pub tag: String,

    #[serde(default)]
    pub readiness: ReadinessCheck,

    #[serde(default)]
    pub env: HashMap<String, EnvValue>,
}

fn default_replicas() -> i32 {
    1
}

fn default_tag() -> String {
    "{commit}".to_string()
}

impl WorkloadConfig {
    /// Registry tag under which the build for `revision` was pushed.
    pub fn tag_for(&self, revision: &Revision) -> String {
        let branch = sanitize_tag_component(&revision.branch);
        self.tag
            .replace("{commit}", &revision.commit)
            .replace("{short}", revision.short())
            .replace("{branch}", &branch)
    }
}

/// Branch names may contain `/` and other characters tags cannot.
fn sanitize_tag_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Handles repository names and the non-empty workload list.

use nonempty::NonEmpty;
use serde::Deserialize;

use super::WorkloadConfig;
use crate::types::validate_repository;

pub fn deserialize_repository<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    validate_repository(&s).map_err(serde::de::Error::custom)?;
    Ok(s)
}

pub fn deserialize_workloads<'de, D>(deserializer: D) -> Result<NonEmpty<WorkloadConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let workloads: Vec<WorkloadConfig> = Vec::deserialize(deserializer)?;

    let mut seen = std::collections::HashSet::new();
    for workload in &workloads {
        if !seen.insert(workload.id.clone()) {
            return Err(serde::de::Error::custom(format!(
                "duplicate workload id: {}",
                workload.id
            )));
        }
    }

    NonEmpty::from_vec(workloads)
        .ok_or_else(|| serde::de::Error::custom("at least one workload is required"))
}

// ABOUTME: DNS-compatible workload identifier validation.
// ABOUTME: Workload IDs name the deployable unit and key the per-workload lock.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadIdError {
    #[error("workload id cannot be empty")]
    Empty,

    #[error("workload id exceeds maximum length of 63 characters")]
    TooLong,

    #[error("workload id cannot start with a hyphen")]
    StartsWithHyphen,

    #[error("workload id cannot end with a hyphen")]
    EndsWithHyphen,

    #[error("workload id must be lowercase")]
    NotLowercase,

    #[error("invalid character in workload id: '{0}'")]
    InvalidChar(char),
}

/// Identity of a deployable unit. Follows RFC 1123 label rules so it can be
/// used verbatim as a container label value and as a lock file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadId(String);

impl WorkloadId {
    pub fn new(value: &str) -> Result<Self, WorkloadIdError> {
        if value.is_empty() {
            return Err(WorkloadIdError::Empty);
        }

        if value.len() > 63 {
            return Err(WorkloadIdError::TooLong);
        }

        if value.starts_with('-') {
            return Err(WorkloadIdError::StartsWithHyphen);
        }

        if value.ends_with('-') {
            return Err(WorkloadIdError::EndsWithHyphen);
        }

        for c in value.chars() {
            if c.is_ascii_uppercase() {
                return Err(WorkloadIdError::NotLowercase);
            }
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(WorkloadIdError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for WorkloadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkloadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        WorkloadId::new(&s).map_err(serde::de::Error::custom)
    }
}

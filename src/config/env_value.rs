// ABOUTME: Config values that are either literals or read from the environment.
// ABOUTME: Used for registry credentials and replica environment variables.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

/// Resolve an optional value, keeping `None` as `None`.
pub fn resolve_optional(value: Option<&EnvValue>) -> Result<Option<String>> {
    value.map(EnvValue::resolve).transpose()
}

/// Resolve into `KEY=value` pairs in key order, the form container runtimes take.
pub fn resolve_env_pairs(map: &HashMap<String, EnvValue>) -> Result<Vec<String>> {
    let mut pairs = map
        .iter()
        .map(|(k, v)| v.resolve().map(|resolved| format!("{k}={resolved}")))
        .collect::<Result<Vec<_>>>()?;
    pairs.sort();
    Ok(pairs)
}

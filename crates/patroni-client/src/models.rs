//! Patroni API models

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pod addressed through its Patroni API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEndpoint {
    pub name: String,
    pub ip: String,
}

impl PodEndpoint {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

/// Body of `PATCH /config`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigPatch {
    pub postgresql: PostgresqlSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostgresqlSection {
    pub parameters: BTreeMap<String, String>,
}

impl ConfigPatch {
    pub fn parameters(parameters: &BTreeMap<String, String>) -> Self {
        Self {
            postgresql: PostgresqlSection {
                parameters: parameters.clone(),
            },
        }
    }
}

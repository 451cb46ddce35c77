//! PostgresCluster CRD
//!
//! Declares a Patroni-managed PostgreSQL cluster: instance count, PostgreSQL
//! parameters, storage, users and databases.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "pgops.microscaler.io",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Team", "type":"string", "jsonPath":".spec.teamId"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.numberOfInstances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Owning team, propagated as a label on every managed object
    #[serde(default)]
    pub team_id: String,

    /// Number of Patroni members (primary + replicas)
    pub number_of_instances: i32,

    /// PostgreSQL version and configuration parameters
    #[serde(default)]
    pub postgresql: PostgresqlParam,

    /// Persistent volume declaration for the data directory
    pub volume: VolumeSpec,

    /// Manifest users: role name -> role flags (e.g. `superuser`, `createdb`)
    #[serde(default)]
    pub users: BTreeMap<String, Vec<String>>,

    /// Databases: database name -> owner role
    #[serde(default)]
    pub databases: BTreeMap<String, String>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,

    /// Overrides the operator-wide database image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Expose the primary through a LoadBalancer service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_master_load_balancer: Option<bool>,

    /// Expose the replicas through a LoadBalancer service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_replica_load_balancer: Option<bool>,

    /// Source CIDRs allowed to reach LoadBalancer services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_source_ranges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlParam {
    /// Major PostgreSQL version
    #[serde(default)]
    pub version: String,

    /// postgresql.conf parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Requested size as a Kubernetes quantity (e.g. "10Gi")
    pub size: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Lifecycle phase of the cluster
    pub phase: ClusterPhase,

    /// Set only when the phase changes, never on a no-op resync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Error from the last failed sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cluster lifecycle phase
///
/// Serializes as PascalCase ("Running", "SyncFailed", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterPhase {
    #[default]
    Creating,
    Updating,
    Running,
    UpdateFailed,
    SyncFailed,
    AddFailed,
    Invalid,
}

impl ClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Updating => "Updating",
            ClusterPhase::Running => "Running",
            ClusterPhase::UpdateFailed => "UpdateFailed",
            ClusterPhase::SyncFailed => "SyncFailed",
            ClusterPhase::AddFailed => "AddFailed",
            ClusterPhase::Invalid => "Invalid",
        }
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserializes_from_manifest() {
        let manifest = serde_json::json!({
            "teamId": "acid",
            "numberOfInstances": 3,
            "postgresql": {
                "version": "16",
                "parameters": { "max_connections": "200" }
            },
            "volume": { "size": "10Gi" },
            "users": { "app_user": ["createdb"] },
            "databases": { "app": "app_user" }
        });

        let spec: PostgresClusterSpec = serde_json::from_value(manifest).unwrap();
        assert_eq!(spec.number_of_instances, 3);
        assert_eq!(spec.postgresql.parameters["max_connections"], "200");
        assert_eq!(spec.volume.size, "10Gi");
        assert_eq!(spec.users["app_user"], vec!["createdb".to_string()]);
        assert_eq!(spec.databases["app"], "app_user");
        assert!(spec.resources.is_none());
    }

    #[test]
    fn test_phase_serializes_pascal_case() {
        let status = PostgresClusterStatus {
            phase: ClusterPhase::SyncFailed,
            last_transition_time: None,
            error: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "SyncFailed");
        assert_eq!(ClusterPhase::Running.to_string(), "Running");
    }
}

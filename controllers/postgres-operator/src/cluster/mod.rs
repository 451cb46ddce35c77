//! Per-cluster reconciliation state and convergence routines.
//!
//! A `Cluster` owns everything one `PostgresCluster` needs across passes: the
//! current spec, the cache of objects last read from or written to the
//! backend, the in-memory user records and the lifecycle phase. It is only
//! ever mutated through `&mut self`, i.e. by the single task holding the
//! cluster's lock in the reconciler registry.
//!
//! - `sync`: the orchestrator running every stage in order
//! - `services`, `action`: network services/endpoints and deferred Actions
//! - `volumes`: volume capacity convergence and resizers
//! - `statefulset`, `pods`, `parameters`: workload controller, rolling restarts
//!   and bootstrap-only parameter push
//! - `pdb`: pod disruption budget
//! - `users`, `credentials`, `secrets`, `database`: roles, passwords, credential
//!   secrets and database ownership
//! - `generate`, `compare`: desired objects and structural comparators

pub mod action;
pub mod compare;
pub mod credentials;
pub mod database;
pub mod generate;
pub mod parameters;
pub mod pdb;
pub mod pods;
pub mod secrets;
pub mod services;
pub mod statefulset;
pub mod sync;
pub mod users;
pub mod volumes;


use crate::config::OperatorConfig;
use crate::store::{KubeStore, ResourceStore};
use action::ActionCounts;
use crds::{ClusterPhase, PostgresClusterSpec};
use database::DatabaseConnector;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::{Api, Client};
use patroni_client::PatroniClientTrait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use users::{PgUser, SystemUser};
use volumes::VolumeResizer;

/// Annotation persisting the rolling-update marker on the StatefulSet
pub const ROLLING_UPDATE_ANNOTATION: &str = "pgops.microscaler.io/rolling-update-required";

pub const APPLICATION_LABEL: &str = "application";
pub const APPLICATION_NAME: &str = "spilo";
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";
pub const TEAM_LABEL: &str = "team";
pub const ROLE_LABEL: &str = "spilo-role";

/// Role of a member inside the Patroni cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PostgresRole {
    Master,
    Replica,
}

impl PostgresRole {
    pub const ALL: [PostgresRole; 2] = [PostgresRole::Master, PostgresRole::Replica];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostgresRole::Master => "master",
            PostgresRole::Replica => "replica",
        }
    }
}

impl fmt::Display for PostgresRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stores for every Kubernetes resource kind the cluster manages.
#[derive(Clone)]
pub struct KubeResources {
    pub services: Arc<dyn ResourceStore<Service>>,
    pub endpoints: Arc<dyn ResourceStore<Endpoints>>,
    pub statefulsets: Arc<dyn ResourceStore<StatefulSet>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub pod_disruption_budgets: Arc<dyn ResourceStore<PodDisruptionBudget>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    pub persistent_volume_claims: Arc<dyn ResourceStore<PersistentVolumeClaim>>,
}

impl KubeResources {
    /// Kubernetes-backed stores scoped to one namespace.
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            services: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            endpoints: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            statefulsets: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pods: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pod_disruption_budgets: Arc::new(KubeStore::new(Api::namespaced(
                client.clone(),
                namespace,
            ))),
            secrets: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            persistent_volume_claims: Arc::new(KubeStore::new(Api::namespaced(client, namespace))),
        }
    }
}

/// External collaborators of one cluster.
#[derive(Clone)]
pub struct ClusterBackends {
    pub kube: KubeResources,
    pub patroni: Arc<dyn PatroniClientTrait>,
    pub database: Arc<dyn DatabaseConnector>,
    pub resizers: Vec<Arc<dyn VolumeResizer>>,
}

/// Last object read from or written to the backend, per resource kind.
///
/// A missing entry means the object was absent on the last pass. Entries are
/// refreshed on every pass and never trusted across passes without a read.
#[derive(Debug, Default)]
pub struct ObservedState {
    pub services: BTreeMap<PostgresRole, Service>,
    pub endpoints: BTreeMap<PostgresRole, Endpoints>,
    pub statefulset: Option<StatefulSet>,
    pub pod_disruption_budget: Option<PodDisruptionBudget>,
    /// Secrets created by this operator, keyed by uid
    pub secrets: BTreeMap<String, Secret>,
}

/// One PostgreSQL cluster under reconciliation.
pub struct Cluster {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) spec: PostgresClusterSpec,
    pub(crate) status: ClusterPhase,
    pub(crate) config: Arc<OperatorConfig>,
    pub(crate) backends: ClusterBackends,
    pub(crate) observed: ObservedState,
    pub(crate) system_users: BTreeMap<SystemUser, PgUser>,
    pub(crate) pg_users: BTreeMap<String, PgUser>,
    /// Service actions applied and failed during the current pass
    pub(crate) action_counts: ActionCounts,
    /// Bootstrap-only parameters last accepted by Patroni
    pub(crate) last_pushed_parameters: Option<BTreeMap<String, String>>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        config: Arc<OperatorConfig>,
        backends: ClusterBackends,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            spec: PostgresClusterSpec::default(),
            status: ClusterPhase::Creating,
            config,
            backends,
            observed: ObservedState::default(),
            system_users: BTreeMap::new(),
            pg_users: BTreeMap::new(),
            action_counts: ActionCounts::default(),
            last_pushed_parameters: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> ClusterPhase {
        self.status
    }

    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    pub fn action_counts(&self) -> ActionCounts {
        self.action_counts
    }

    pub(crate) fn set_spec(&mut self, spec: PostgresClusterSpec) {
        self.spec = spec;
    }

    pub(crate) fn set_status(&mut self, phase: ClusterPhase) {
        if self.status != phase {
            info!(
                "cluster {}/{} status: {} -> {}",
                self.namespace, self.name, self.status, phase
            );
        }
        self.status = phase;
    }

    pub(crate) fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    pub(crate) fn database_access_disabled(&self) -> bool {
        !self.config.enable_database_access
    }

    pub(crate) fn number_of_instances(&self) -> i32 {
        self.spec.number_of_instances
    }

    /// Labels shared by every object of the cluster.
    pub(crate) fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APPLICATION_LABEL.to_string(), APPLICATION_NAME.to_string());
        labels.insert(CLUSTER_NAME_LABEL.to_string(), self.name.clone());
        if !self.spec.team_id.is_empty() {
            labels.insert(TEAM_LABEL.to_string(), self.spec.team_id.to_lowercase());
        }
        labels
    }

    /// Labels selecting the cluster's pods (team label excluded so a team
    /// rename does not orphan running pods).
    pub(crate) fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APPLICATION_LABEL.to_string(), APPLICATION_NAME.to_string());
        labels.insert(CLUSTER_NAME_LABEL.to_string(), self.name.clone());
        labels
    }

    pub(crate) fn role_labels(&self, role: PostgresRole) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
        labels
    }

    /// Label selector string (`k=v,k=v`) for the cluster's pods and claims.
    pub(crate) fn label_selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn service_name(&self, role: PostgresRole) -> String {
        match role {
            PostgresRole::Master => self.name.clone(),
            PostgresRole::Replica => format!("{}-repl", self.name),
        }
    }

    pub(crate) fn endpoint_name(&self, role: PostgresRole) -> String {
        self.service_name(role)
    }

    pub(crate) fn statefulset_name(&self) -> String {
        self.name.clone()
    }

    pub(crate) fn pod_disruption_budget_name(&self) -> String {
        format!("postgres-{}-pdb", self.name)
    }
}

/// `namespace/name` of an object, for log lines.
pub(crate) fn name_from_meta(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or("default"),
        meta.name.as_deref().unwrap_or_default()
    )
}

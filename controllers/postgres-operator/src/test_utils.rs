//! Test utilities for unit testing the reconciliation core
//!
//! In-memory stand-ins for every backend a `Cluster` talks to, plus fixture
//! builders. All stores of one `TestBackends` share a write journal so tests
//! can assert on the order of backend mutations.

use crate::cluster::database::{ConnectionTarget, DatabaseConnection, DatabaseConnector};
use crate::cluster::users::{DbRole, RoleOrigin};
use crate::cluster::volumes::{PvcResizer, VolumeResizer};
use crate::cluster::{Cluster, ClusterBackends, KubeResources, ROLE_LABEL};
use crate::config::{OperatorConfig, VolumeResizerKind};
use crate::error::{ControllerError, StoreError};
use crate::store::{Propagation, ResourceStore};
use async_trait::async_trait;
use crds::{PostgresClusterSpec, PostgresqlParam, VolumeSpec};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Endpoints, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod,
    PodCondition, PodStatus, Secret, Service, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use patroni_client::MockPatroniClient;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_CLUSTER: &str = "acid-test";

/// Ordered record of backend writes (`"create StatefulSet acid-test"`)
pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    Delete,
    List,
}

type Hook<K> = Box<dyn Fn(&MockStore<K>, &K) + Send + Sync>;

static UID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-memory `ResourceStore` with Kubernetes-like semantics: create fails on
/// existing names, update on missing ones, every write bumps the
/// resourceVersion and lands in the journal.
pub struct MockStore<K> {
    kind: &'static str,
    objects: Mutex<BTreeMap<String, K>>,
    journal: Journal,
    failures: Mutex<HashSet<(StoreOp, String)>>,
    conflicts: Mutex<HashSet<String>>,
    after_create: Mutex<Vec<Hook<K>>>,
    after_delete: Mutex<Vec<Hook<K>>>,
}

fn next_uid(kind: &str) -> String {
    format!("{}-uid-{}", kind.to_lowercase(), UID_COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => false,
        })
}

impl<K> MockStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, journal: Journal) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            journal,
            failures: Mutex::new(HashSet::new()),
            conflicts: Mutex::new(HashSet::new()),
            after_create: Mutex::new(Vec::new()),
            after_delete: Mutex::new(Vec::new()),
        }
    }

    /// Seeds an object without journaling; assigns uid and resourceVersion
    /// when missing.
    pub fn insert(&self, mut object: K) -> K {
        let meta = object.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(next_uid(self.kind));
        }
        if meta.resource_version.is_none() {
            meta.resource_version = Some("1".to_string());
        }
        let name = meta.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(name, object.clone());
        object
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().remove(name)
    }

    /// Makes every `op` on `name` fail with a backend error.
    pub fn fail_on(&self, op: StoreOp, name: &str) {
        self.failures.lock().unwrap().insert((op, name.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
        self.conflicts.lock().unwrap().clear();
    }

    /// Makes every create of `name` lose a race against a writer whose
    /// object this store never shows.
    pub fn conflict_on_create(&self, name: &str) {
        self.conflicts.lock().unwrap().insert(name.to_string());
    }

    /// Runs after every successful create, outside the object lock.
    pub fn on_create(&self, hook: impl Fn(&MockStore<K>, &K) + Send + Sync + 'static) {
        self.after_create.lock().unwrap().push(Box::new(hook));
    }

    /// Runs after every successful delete, outside the object lock.
    pub fn on_delete(&self, hook: impl Fn(&MockStore<K>, &K) + Send + Sync + 'static) {
        self.after_delete.lock().unwrap().push(Box::new(hook));
    }

    fn check_failure(&self, op: StoreOp, name: &str) -> Result<(), StoreError> {
        if self.failures.lock().unwrap().contains(&(op, name.to_string())) {
            return Err(StoreError::Backend(format!(
                "injected {:?} failure for {} {}",
                op, self.kind, name
            )));
        }
        Ok(())
    }

    fn record(&self, op: &str, name: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} {} {}", op, self.kind, name));
    }

    fn not_found(&self, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MockStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.check_failure(StoreOp::Get, name)?;
        self.object(name).ok_or_else(|| self.not_found(name))
    }

    async fn create(&self, object: &K) -> Result<K, StoreError> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.check_failure(StoreOp::Create, &name)?;
        if self.conflicts.lock().unwrap().contains(&name) {
            return Err(StoreError::AlreadyExists {
                kind: self.kind.to_string(),
                name,
            });
        }
        let created = {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&name) {
                return Err(StoreError::AlreadyExists {
                    kind: self.kind.to_string(),
                    name,
                });
            }
            let mut created = object.clone();
            let meta = created.meta_mut();
            meta.uid = Some(next_uid(self.kind));
            meta.resource_version = Some("1".to_string());
            objects.insert(name.clone(), created.clone());
            created
        };
        self.record("create", &name);
        for hook in self.after_create.lock().unwrap().iter() {
            hook(self, &created);
        }
        Ok(created)
    }

    async fn update(&self, object: &K) -> Result<K, StoreError> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.check_failure(StoreOp::Update, &name)?;
        let updated = {
            let mut objects = self.objects.lock().unwrap();
            let current = objects.get(&name).ok_or_else(|| self.not_found(&name))?;
            let version = current
                .meta()
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let uid = current.meta().uid.clone();

            let mut updated = object.clone();
            let meta = updated.meta_mut();
            meta.uid = uid;
            meta.resource_version = Some((version + 1).to_string());
            objects.insert(name.clone(), updated.clone());
            updated
        };
        self.record("update", &name);
        Ok(updated)
    }

    async fn delete(&self, name: &str, _propagation: Propagation) -> Result<(), StoreError> {
        self.check_failure(StoreOp::Delete, name)?;
        let deleted = self
            .objects
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| self.not_found(name))?;
        self.record("delete", name);
        for hook in self.after_delete.lock().unwrap().iter() {
            hook(self, &deleted);
        }
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, StoreError> {
        self.check_failure(StoreOp::List, label_selector)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| matches_selector(o.meta().labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }
}

/// Shared state behind `FakeDatabase`.
#[derive(Debug, Default)]
pub struct FakeDatabaseState {
    pub roles: BTreeMap<String, DbRole>,
    pub databases: BTreeMap<String, String>,
    pub statements: Vec<String>,
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub targets: Vec<ConnectionTarget>,
    /// Statements containing this text fail
    pub fail_statement_containing: Option<String>,
    pub fail_connect: bool,
}

/// `DatabaseConnector` keeping roles and databases in memory. Executed
/// statements are interpreted so a second pass sees the first pass's effects.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    pub state: Arc<Mutex<FakeDatabaseState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(self, role: DbRole) -> Self {
        self.state.lock().unwrap().roles.insert(role.name.clone(), role);
        self
    }

    pub fn with_database(self, name: &str, owner: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .databases
            .insert(name.to_string(), owner.to_string());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn role(&self, name: &str) -> Option<DbRole> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn databases(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().databases.clone()
    }

    pub fn connections(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.connections_opened, state.connections_closed)
    }

    pub fn fail_statements_containing(&self, text: &str) {
        self.state.lock().unwrap().fail_statement_containing = Some(text.to_string());
    }
}

#[async_trait]
impl DatabaseConnector for FakeDatabase {
    async fn connect(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn DatabaseConnection>, ControllerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(ControllerError::Validation("connection refused".to_string()));
        }
        state.connections_opened += 1;
        state.targets.push(target.clone());
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeDatabaseState>>,
}

fn unquote(token: &str) -> String {
    token.trim_matches('"').trim_matches('\'').to_string()
}

fn new_db_role(name: &str) -> DbRole {
    DbRole {
        name: name.to_string(),
        flags: DbRole::flags_from_attributes([false, true, false, false, false, false, false]),
        ..DbRole::default()
    }
}

fn apply_role_attributes(role: &mut DbRole, tokens: &[&str]) {
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        if *token == "PASSWORD" {
            role.password = iter.next().map(|v| unquote(v));
            continue;
        }
        let opposite = match token.strip_prefix("NO") {
            Some(attribute) => attribute.to_string(),
            None => format!("NO{}", token),
        };
        role.flags.remove(&opposite);
        role.flags.insert(token.to_string());
    }
}

impl FakeDatabaseState {
    fn apply(&mut self, statement: &str) -> Result<(), ControllerError> {
        let tokens: Vec<&str> = statement.split_whitespace().collect();
        let unsupported = || ControllerError::Validation(format!("unsupported statement {:?}", statement));
        match tokens.as_slice() {
            ["CREATE", "ROLE", name, "WITH", rest @ ..] => {
                let mut role = new_db_role(&unquote(name));
                apply_role_attributes(&mut role, rest);
                self.roles.insert(role.name.clone(), role);
            }
            ["ALTER", "ROLE", from, "RENAME", "TO", to] => {
                let mut role = self.roles.remove(&unquote(from)).ok_or_else(unsupported)?;
                role.name = unquote(to);
                self.roles.insert(role.name.clone(), role);
            }
            ["ALTER", "ROLE", name, "WITH", rest @ ..] => {
                let role = self.roles.get_mut(&unquote(name)).ok_or_else(unsupported)?;
                apply_role_attributes(role, rest);
            }
            ["ALTER", "ROLE", name, "SET", key, "TO", value] => {
                let role = self.roles.get_mut(&unquote(name)).ok_or_else(unsupported)?;
                role.parameters.insert(unquote(key), unquote(value));
            }
            ["GRANT", group, "TO", name] => {
                let role = self.roles.get_mut(&unquote(name)).ok_or_else(unsupported)?;
                role.member_of.insert(unquote(group));
            }
            ["COMMENT", "ON", "ROLE", name, "IS", comment] => {
                let role = self.roles.get_mut(&unquote(name)).ok_or_else(unsupported)?;
                role.origin = RoleOrigin::from_role_comment(&unquote(comment));
            }
            ["DROP", "ROLE", "IF", "EXISTS", name] => {
                self.roles.remove(&unquote(name));
            }
            ["CREATE", "DATABASE", name, "OWNER", owner] => {
                self.databases.insert(unquote(name), unquote(owner));
            }
            ["ALTER", "DATABASE", name, "OWNER", "TO", owner] => {
                self.databases.insert(unquote(name), unquote(owner));
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for FakeConnection {
    async fn read_roles(&mut self, names: &[String]) -> Result<Vec<DbRole>, ControllerError> {
        let wanted: BTreeSet<&String> = names.iter().collect();
        Ok(self
            .state
            .lock()
            .unwrap()
            .roles
            .values()
            .filter(|r| wanted.contains(&r.name) || r.origin.is_some())
            .cloned()
            .collect())
    }

    async fn read_databases(&mut self) -> Result<BTreeMap<String, String>, ControllerError> {
        Ok(self.state.lock().unwrap().databases.clone())
    }

    async fn execute(&mut self, statement: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(statement.to_string());
        if let Some(text) = &state.fail_statement_containing {
            if statement.contains(text.as_str()) {
                return Err(ControllerError::Validation(format!(
                    "statement failed: {}",
                    statement
                )));
            }
        }
        state.apply(statement)
    }

    async fn close(self: Box<Self>) -> Result<(), ControllerError> {
        self.state.lock().unwrap().connections_closed += 1;
        Ok(())
    }
}

/// Resizer recording every call; claims it does not own are left alone.
#[derive(Debug, Clone, Default)]
pub struct RecordingResizer {
    pub calls: Arc<Mutex<Vec<(String, u64, u64)>>>,
    pub owned_prefix: String,
}

impl RecordingResizer {
    pub fn new(owned_prefix: &str) -> Self {
        Self {
            calls: Arc::default(),
            owned_prefix: owned_prefix.to_string(),
        }
    }

    pub fn calls(&self) -> Vec<(String, u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VolumeResizer for RecordingResizer {
    fn provider(&self) -> &'static str {
        "recording"
    }

    fn owns(&self, claim: &PersistentVolumeClaim) -> bool {
        claim
            .metadata
            .name
            .as_deref()
            .is_some_and(|n| n.starts_with(&self.owned_prefix))
    }

    async fn resize(
        &self,
        volume_id: &str,
        current_bytes: u64,
        desired_bytes: u64,
    ) -> Result<(), ControllerError> {
        if desired_bytes < current_bytes {
            return Err(ControllerError::Resize(format!(
                "refusing to shrink {}",
                volume_id
            )));
        }
        self.calls
            .lock()
            .unwrap()
            .push((volume_id.to_string(), current_bytes, desired_bytes));
        Ok(())
    }
}

/// Every backend of one test cluster, sharing one journal.
pub struct TestBackends {
    pub journal: Journal,
    pub services: Arc<MockStore<Service>>,
    pub endpoints: Arc<MockStore<Endpoints>>,
    pub statefulsets: Arc<MockStore<StatefulSet>>,
    pub pods: Arc<MockStore<Pod>>,
    pub pod_disruption_budgets: Arc<MockStore<PodDisruptionBudget>>,
    pub secrets: Arc<MockStore<Secret>>,
    pub persistent_volume_claims: Arc<MockStore<PersistentVolumeClaim>>,
    pub patroni: MockPatroniClient,
    pub database: FakeDatabase,
}

impl TestBackends {
    pub fn new() -> Self {
        let journal: Journal = Arc::default();
        Self {
            services: Arc::new(MockStore::new("Service", journal.clone())),
            endpoints: Arc::new(MockStore::new("Endpoints", journal.clone())),
            statefulsets: Arc::new(MockStore::new("StatefulSet", journal.clone())),
            pods: Arc::new(MockStore::new("Pod", journal.clone())),
            pod_disruption_budgets: Arc::new(MockStore::new(
                "PodDisruptionBudget",
                journal.clone(),
            )),
            secrets: Arc::new(MockStore::new("Secret", journal.clone())),
            persistent_volume_claims: Arc::new(MockStore::new(
                "PersistentVolumeClaim",
                journal.clone(),
            )),
            patroni: MockPatroniClient::new(),
            database: FakeDatabase::new(),
            journal,
        }
    }

    pub fn kube(&self) -> KubeResources {
        KubeResources {
            services: self.services.clone(),
            endpoints: self.endpoints.clone(),
            statefulsets: self.statefulsets.clone(),
            pods: self.pods.clone(),
            pod_disruption_budgets: self.pod_disruption_budgets.clone(),
            secrets: self.secrets.clone(),
            persistent_volume_claims: self.persistent_volume_claims.clone(),
        }
    }

    /// Backends with the claim-expansion resizer.
    pub fn backends(&self) -> ClusterBackends {
        let resizer: Arc<dyn VolumeResizer> =
            Arc::new(PvcResizer::new(self.persistent_volume_claims.clone()));
        self.backends_with_resizers(vec![resizer])
    }

    pub fn backends_with_resizers(&self, resizers: Vec<Arc<dyn VolumeResizer>>) -> ClusterBackends {
        ClusterBackends {
            kube: self.kube(),
            patroni: Arc::new(self.patroni.clone()),
            database: Arc::new(self.database.clone()),
            resizers,
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    /// Stands in for the StatefulSet controller: creating a StatefulSet
    /// spawns its ready pods, deleting a pod brings up a replacement with a
    /// new uid.
    pub fn simulate_statefulset_controller(&self) {
        let pods = self.pods.clone();
        self.statefulsets.on_create(move |_, statefulset| {
            let name = statefulset.metadata.name.clone().unwrap_or_default();
            let replicas = statefulset
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0);
            let labels = statefulset
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.clone())
                .unwrap_or_default();
            for i in 0..replicas {
                let pod_name = format!("{}-{}", name, i);
                if pods.object(&pod_name).is_some() {
                    continue;
                }
                let role = if i == 0 { "master" } else { "replica" };
                let mut pod_labels = labels.clone();
                pod_labels.insert(ROLE_LABEL.to_string(), role.to_string());
                pods.insert(ready_pod(&pod_name, pod_labels, &format!("10.0.0.{}", i + 1)));
            }
        });

        self.pods.on_delete(|store, pod| {
            let mut replacement = pod.clone();
            replacement.metadata.uid = None;
            replacement.metadata.resource_version = None;
            store.insert(replacement);
        });
    }
}

impl Default for TestBackends {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with millisecond polling budgets.
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        resource_check_interval: Duration::from_millis(1),
        resource_check_timeout: Duration::from_millis(200),
        pod_label_wait_timeout: Duration::from_millis(200),
        volume_resizer: VolumeResizerKind::Pvc,
        ..OperatorConfig::default()
    }
}

pub fn test_spec(instances: i32, volume_size: &str) -> PostgresClusterSpec {
    PostgresClusterSpec {
        team_id: "acid".to_string(),
        number_of_instances: instances,
        postgresql: PostgresqlParam {
            version: "16".to_string(),
            parameters: BTreeMap::from([
                ("max_connections".to_string(), "200".to_string()),
                ("shared_buffers".to_string(), "128MB".to_string()),
            ]),
        },
        volume: VolumeSpec {
            size: volume_size.to_string(),
            storage_class: None,
        },
        users: BTreeMap::from([("app_user".to_string(), vec!["createdb".to_string()])]),
        databases: BTreeMap::from([("app".to_string(), "app_user".to_string())]),
        ..PostgresClusterSpec::default()
    }
}

pub fn test_cluster(backends: &TestBackends, config: OperatorConfig) -> Cluster {
    Cluster::new(
        TEST_CLUSTER,
        TEST_NAMESPACE,
        Arc::new(config),
        backends.backends(),
    )
}

pub fn cluster_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("application".to_string(), "spilo".to_string()),
        ("cluster-name".to_string(), TEST_CLUSTER.to_string()),
    ])
}

pub fn ready_pod(name: &str, labels: BTreeMap<String, String>, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Bound claim of `size` (request and capacity).
pub fn bound_claim(name: &str, size: &str) -> PersistentVolumeClaim {
    let storage = BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))]);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            labels: Some(cluster_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(storage.clone()),
                ..Default::default()
            }),
            volume_name: Some(format!("pv-{}", name)),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(storage),
            ..Default::default()
        }),
    }
}

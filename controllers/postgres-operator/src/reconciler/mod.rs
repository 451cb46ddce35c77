//! Reconciliation of `PostgresCluster` resources.
//!
//! The reconciler keeps one `Cluster` per namespace/name in a registry. Each
//! entry sits behind its own async lock, so a cluster is synced by one task
//! at a time while distinct clusters proceed concurrently. After a sync the
//! status sub-resource is patched when the phase changed, and failures are
//! retried with a per-cluster Fibonacci backoff. A finalizer keeps deleted
//! clusters visible until their registry entry is dropped.

pub mod status;

#[cfg(test)]
mod reconciler_test;

use crate::backoff::FibonacciBackoff;
use crate::cluster::database::SqlxConnector;
use crate::cluster::volumes::{PvcResizer, VolumeResizer};
use crate::cluster::{Cluster, ClusterBackends, KubeResources};
use crate::config::{OperatorConfig, VolumeResizerKind};
use crate::error::ControllerError;
use crate::metrics::OperatorMetrics;
use crate::reconcile_helpers::{create_status_patch, status_needs_update};
use crds::PostgresCluster;
use kube::{Api, Client};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Error as FinalizerError, Event};
use patroni_client::{PatroniClient, PatroniClientTrait};
use status::{KubeStatusWriter, StatusWriter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Namespace and name of a cluster
pub type ClusterKey = (String, String);

/// Builds the backends of a cluster living in the given namespace.
pub type BackendFactory = Arc<dyn Fn(&str) -> ClusterBackends + Send + Sync>;

/// Finalizer placed on every reconciled `PostgresCluster`
pub const CLUSTER_FINALIZER: &str = "pgops.microscaler.io/finalizer";

const MIN_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Backoff state for a cluster
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(MIN_BACKOFF, MAX_BACKOFF),
            error_count: 0,
        }
    }
}

fn cluster_key(resource: &PostgresCluster) -> Result<ClusterKey, ControllerError> {
    let name = resource.metadata.name.clone().ok_or_else(|| {
        ControllerError::InvalidConfig("PostgresCluster missing name".to_string())
    })?;
    let namespace = resource
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

fn display_key(key: &ClusterKey) -> String {
    format!("{}/{}", key.0, key.1)
}

/// Reconciles `PostgresCluster` resources.
pub struct Reconciler {
    client: Client,
    config: Arc<OperatorConfig>,
    metrics: Arc<OperatorMetrics>,
    backends_for: BackendFactory,
    status_writer: Arc<dyn StatusWriter>,
    clusters: tokio::sync::Mutex<HashMap<ClusterKey, Arc<tokio::sync::Mutex<Cluster>>>>,
    backoff_states: Mutex<HashMap<ClusterKey, BackoffState>>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        metrics: Arc<OperatorMetrics>,
        backends_for: BackendFactory,
        status_writer: Arc<dyn StatusWriter>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            backends_for,
            status_writer,
            clusters: tokio::sync::Mutex::new(HashMap::new()),
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciler talking to the Kubernetes API, Patroni and PostgreSQL.
    pub fn for_kubernetes(
        client: Client,
        config: Arc<OperatorConfig>,
        metrics: Arc<OperatorMetrics>,
    ) -> Result<Self, ControllerError> {
        let patroni: Arc<dyn PatroniClientTrait> =
            Arc::new(PatroniClient::new(config.patroni_api_port)?);
        let resizer_kind = config.volume_resizer;
        let kube_client = client.clone();
        let backends_for: BackendFactory = Arc::new(move |namespace: &str| {
            let kube = KubeResources::namespaced(kube_client.clone(), namespace);
            let resizers: Vec<Arc<dyn VolumeResizer>> = match resizer_kind {
                VolumeResizerKind::Pvc => {
                    vec![Arc::new(PvcResizer::new(kube.persistent_volume_claims.clone()))]
                }
                VolumeResizerKind::None => Vec::new(),
            };
            ClusterBackends {
                kube,
                patroni: patroni.clone(),
                database: Arc::new(SqlxConnector),
                resizers,
            }
        });
        Ok(Self::new(
            client.clone(),
            config,
            metrics,
            backends_for,
            Arc::new(KubeStatusWriter::new(client)),
        ))
    }

    /// Returns the registry entry for a cluster, creating it on first use.
    async fn cluster(&self, key: &ClusterKey) -> Arc<tokio::sync::Mutex<Cluster>> {
        let mut clusters = self.clusters.lock().await;
        let entry = clusters.entry(key.clone()).or_insert_with(|| {
            info!("registering cluster {}", display_key(key));
            Arc::new(tokio::sync::Mutex::new(Cluster::new(
                key.1.clone(),
                key.0.clone(),
                self.config.clone(),
                (self.backends_for)(&key.0),
            )))
        });
        let handle = entry.clone();
        self.metrics.managed_clusters.set(clusters.len() as i64);
        handle
    }

    /// Drops a cluster from the registry.
    pub async fn evict(&self, key: &ClusterKey) {
        let mut clusters = self.clusters.lock().await;
        if clusters.remove(key).is_some() {
            info!("cluster {} removed from the registry", display_key(key));
        }
        self.metrics.managed_clusters.set(clusters.len() as i64);
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }

    pub async fn is_registered(&self, key: &ClusterKey) -> bool {
        self.clusters.lock().await.contains_key(key)
    }

    /// Entry point of the controller loop.
    ///
    /// A cluster without the finalizer only gets it added; the resulting
    /// watch event starts the first sync. Deleted clusters are evicted before
    /// the finalizer is removed.
    pub async fn reconcile_with_finalizer(
        &self,
        resource: Arc<PostgresCluster>,
    ) -> Result<Action, ControllerError> {
        let namespace = cluster_key(&resource)?.0;
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &namespace);

        finalizer(&api, CLUSTER_FINALIZER, resource, |event| async move {
            match event {
                Event::Apply(resource) => self.reconcile(&resource).await,
                Event::Cleanup(resource) => self.cleanup(&resource).await,
            }
        })
        .await
        .map_err(|e| match e {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
            other => ControllerError::Finalizer(Box::new(other)),
        })
    }

    /// Forgets a deleted cluster. Its Kubernetes objects are not touched.
    pub async fn cleanup(&self, resource: &PostgresCluster) -> Result<Action, ControllerError> {
        let key = cluster_key(resource)?;
        debug!("cluster {} is being deleted", display_key(&key));
        self.evict(&key).await;
        Ok(Action::await_change())
    }

    /// Syncs one `PostgresCluster` and records the outcome on its status.
    pub async fn reconcile(&self, resource: &PostgresCluster) -> Result<Action, ControllerError> {
        let key = cluster_key(resource)?;

        let handle = self.cluster(&key).await;
        let mut cluster = handle.lock().await;

        let started = Instant::now();
        let result = cluster.sync(resource.spec.clone()).await;
        self.metrics
            .observe_sync(started.elapsed(), &result, cluster.action_counts());

        let phase = cluster.status();
        drop(cluster);
        if status_needs_update(resource.status.as_ref(), phase) {
            let error = result.as_ref().err().map(ToString::to_string);
            let patch = create_status_patch(phase, error.as_deref(), chrono::Utc::now());
            if let Err(e) = self.status_writer.patch_status(&key.0, &key.1, patch).await {
                warn!("could not update status of cluster {}: {}", display_key(&key), e);
            }
        }

        match result {
            Ok(()) => {
                self.reset_error(&key);
                info!("cluster {} is in sync", display_key(&key));
                Ok(Action::requeue(self.config.resync_period))
            }
            Err(e) => {
                self.increment_error(&key);
                Err(e)
            }
        }
    }

    /// Next requeue delay for a failing cluster.
    ///
    /// Returns (delay, consecutive error count)
    pub fn backoff_for(&self, key: &ClusterKey) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.clone()).or_insert_with(BackoffState::new);
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("failed to lock backoff states: {}, using default backoff", e);
                (MIN_BACKOFF, 0)
            }
        }
    }

    fn increment_error(&self, key: &ClusterKey) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states
                .entry(key.clone())
                .or_insert_with(BackoffState::new)
                .error_count += 1;
        }
    }

    fn reset_error(&self, key: &ClusterKey) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(key) {
                state.error_count = 0;
                state.backoff.reset();
            }
        }
    }
}

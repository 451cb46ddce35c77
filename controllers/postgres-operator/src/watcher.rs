//! Kubernetes resource watcher.
//!
//! Drives reconciliation of `PostgresCluster` resources through
//! `kube_runtime::Controller`, which handles reconnection, requeues and
//! deduplication of events for the same object.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::PostgresCluster;
use futures::StreamExt;
use kube::Api;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn cluster_key(resource: &PostgresCluster) -> (String, String) {
    (
        resource
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        resource.metadata.name.clone().unwrap_or_default(),
    )
}

async fn reconcile(
    resource: Arc<PostgresCluster>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, ControllerError> {
    debug!("reconciling PostgresCluster {:?}", resource.metadata.name);
    reconciler.reconcile_with_finalizer(resource).await
}

fn error_policy(
    resource: Arc<PostgresCluster>,
    error: &ControllerError,
    reconciler: Arc<Reconciler>,
) -> Action {
    let key = cluster_key(&resource);
    let (delay, error_count) = reconciler.backoff_for(&key);
    warn!(
        "sync of cluster {}/{} failed ({} consecutive errors), retrying in {:?}: {}",
        key.0, key.1, error_count, delay, error
    );
    Action::requeue(delay)
}

/// Watches `PostgresCluster` resources until the stream ends.
pub async fn watch_clusters(
    api: Api<PostgresCluster>,
    reconciler: Arc<Reconciler>,
) -> Result<(), ControllerError> {
    // Debounce batches bursts of events on one object; status patches
    // written by the reconciler itself land in such bursts.
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(8);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("reconciled {}", object.name),
                Err(e) => error!("PostgresCluster controller error: {}", e),
            }
        })
        .await;

    info!("PostgresCluster controller stopped");
    Ok(())
}

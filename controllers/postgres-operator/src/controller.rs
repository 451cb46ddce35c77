//! Main controller implementation.
//!
//! Wires the Kubernetes client, the reconciler and the probe server
//! together and runs them until one of them exits.

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::metrics::{self, OperatorMetrics, ProbeState};
use crate::reconciler::Reconciler;
use crate::watcher::watch_clusters;
use crds::PostgresCluster;
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for `PostgresCluster` resources.
pub struct Controller {
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Connects to Kubernetes and starts the watcher and the probe server.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        let config = Arc::new(config);
        let metrics = Arc::new(OperatorMetrics::new().map_err(|e| {
            ControllerError::InvalidConfig(format!("could not register metrics: {}", e))
        })?);
        let ready = Arc::new(AtomicBool::new(false));

        let probe_server = {
            let addr = config.probe_addr.clone();
            let state = ProbeState {
                metrics: metrics.clone(),
                ready: ready.clone(),
            };
            tokio::spawn(async move { metrics::serve(&addr, state).await })
        };

        let kube_client = Client::try_default().await?;
        let api: Api<PostgresCluster> = match config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(kube_client.clone(), namespace),
            None => Api::all(kube_client.clone()),
        };

        let reconciler = Arc::new(Reconciler::for_kubernetes(
            kube_client,
            config.clone(),
            metrics,
        )?);

        let cluster_watcher = tokio::spawn(async move { watch_clusters(api, reconciler).await });
        ready.store(true, Ordering::Relaxed);

        Ok(Self {
            cluster_watcher,
            probe_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("PostgreSQL operator running");

        tokio::select! {
            result = &mut self.cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("PostgresCluster watcher panicked: {}", e)))??;
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("probe server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}

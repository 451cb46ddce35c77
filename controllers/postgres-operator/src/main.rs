//! PostgreSQL Operator
//!
//! Converges Patroni/Spilo PostgreSQL clusters declared as `PostgresCluster`
//! resources: services and endpoints, credential secrets, volumes, the
//! StatefulSet with its rolling restarts, the pod disruption budget, and the
//! roles and databases inside PostgreSQL.

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod metrics;
mod reconcile_helpers;
mod reconciler;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube and reqwest both pull in rustls; pick the provider once
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting PostgreSQL operator");

    let config = OperatorConfig::from_env()?;
    info!("Configuration:");
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Dry run: {}", config.dry_run);
    info!("  Database access: {}", config.enable_database_access);
    info!("  Volume resizer: {:?}", config.volume_resizer);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}

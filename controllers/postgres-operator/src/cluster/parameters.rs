//! Cluster-wide PostgreSQL parameters that Patroni only accepts through its
//! dynamic configuration API.

use super::Cluster;
use crate::error::ControllerError;
use patroni_client::PodEndpoint;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Parameters Patroni keeps in its cluster-wide configuration; a value in
/// `postgresql.conf` is ignored for these.
pub const BOOTSTRAP_ONLY_PARAMETERS: [&str; 7] = [
    "max_connections",
    "max_locks_per_transaction",
    "max_worker_processes",
    "max_prepared_transactions",
    "wal_level",
    "wal_log_hints",
    "track_commit_timestamp",
];

pub fn is_bootstrap_only_parameter(name: &str) -> bool {
    BOOTSTRAP_ONLY_PARAMETERS.contains(&name)
}

impl Cluster {
    /// Declared parameters that have to go through Patroni.
    pub(crate) fn bootstrap_only_parameters(&self) -> BTreeMap<String, String> {
        self.spec
            .postgresql
            .parameters
            .iter()
            .filter(|(name, _)| is_bootstrap_only_parameter(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Pushes the bootstrap-only parameters through the first pod that
    /// accepts them.
    ///
    /// The push runs after every StatefulSet write and whenever the
    /// parameters differ from the last accepted push. Failure on every pod
    /// is an error.
    pub(crate) async fn check_and_set_global_postgresql_configuration(
        &mut self,
        statefulset_written: bool,
    ) -> Result<(), ControllerError> {
        let parameters = self.bootstrap_only_parameters();
        if parameters.is_empty() {
            return Ok(());
        }
        if !statefulset_written && self.last_pushed_parameters.as_ref() == Some(&parameters) {
            debug!(
                "cluster {}/{}: global postgresql parameters are unchanged",
                self.namespace, self.name
            );
            return Ok(());
        }
        if self.number_of_instances() <= 0 {
            debug!(
                "cluster {}/{} has no instances, not pushing global postgresql parameters",
                self.namespace, self.name
            );
            return Ok(());
        }

        let mut pods = self.list_pods().await?;
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        if pods.is_empty() {
            return Err(ControllerError::ConvergenceTimeout(
                "could not call the Patroni API: cluster has no pods".to_string(),
            ));
        }

        let total = pods.len();
        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default();
            debug!(
                "calling the Patroni API on pod {}/{} to set {:?}",
                self.namespace, name, parameters
            );
            match self
                .backends
                .patroni
                .set_postgres_parameters(&PodEndpoint::new(name.clone(), ip), &parameters)
                .await
            {
                Ok(()) => {
                    info!(
                        "cluster {}/{}: set global postgresql parameters through pod {}",
                        self.namespace, self.name, name
                    );
                    self.last_pushed_parameters = Some(parameters);
                    return Ok(());
                }
                Err(e) => {
                    warn!("could not patch postgres parameters with pod {}: {}", name, e);
                }
            }
        }

        Err(ControllerError::ConvergenceTimeout(format!(
            "could not reach the Patroni API to set postgres parameters: failed on every pod ({} total)",
            total
        )))
    }
}

//! Sync: one full reconciliation pass of a cluster.
//!
//! Stages run strictly in order. A failed stage ends the pass, with two
//! exceptions: service actions that fail to apply are only logged, and a
//! StatefulSet "already exists" race is left to the next pass.

use super::action::ActionCounts;
use super::Cluster;
use crate::error::ControllerError;
use crds::{ClusterPhase, PostgresClusterSpec};
use tracing::{debug, info, warn};

impl Cluster {
    /// Converges every managed object of the cluster towards `spec`.
    ///
    /// Objects found missing are created rather than treated as errors. The
    /// cluster ends up `Running` on success and `SyncFailed` otherwise.
    pub async fn sync(&mut self, spec: PostgresClusterSpec) -> Result<(), ControllerError> {
        self.set_spec(spec);
        self.action_counts = ActionCounts::default();

        let result = self.sync_stages().await;
        match &result {
            Ok(()) => {
                if self.status != ClusterPhase::Running {
                    self.set_status(ClusterPhase::Running);
                }
            }
            Err(e) => {
                warn!(
                    "error while syncing cluster {}/{}: {}",
                    self.namespace, self.name, e
                );
                self.set_status(ClusterPhase::SyncFailed);
            }
        }
        result
    }

    async fn sync_stages(&mut self) -> Result<(), ControllerError> {
        debug!("syncing users");
        self.init_users()
            .await
            .map_err(|e| ControllerError::in_stage("users", e))?;

        debug!("syncing secrets");
        self.sync_secrets()
            .await
            .map_err(|e| ControllerError::in_stage("secrets", e))?;

        debug!("syncing services");
        let actions = self
            .sync_services()
            .await
            .map_err(|e| ControllerError::in_stage("services", e))?;
        self.apply_actions(actions).await;

        // Volumes grow before the StatefulSet changes so that no pod waits
        // for disk space it cannot get.
        debug!("syncing persistent volumes");
        self.sync_volumes()
            .await
            .map_err(|e| ControllerError::in_stage("volumes", e))?;

        debug!("syncing statefulsets");
        if let Err(e) = self.sync_statefulset().await {
            if !e.is_already_exists() {
                return Err(ControllerError::in_stage("statefulsets", e));
            }
            info!(
                "cluster {}/{}: {}, leaving it to the next sync",
                self.namespace, self.name, e
            );
        }

        if self.database_access_disabled() || self.number_of_instances() <= 0 {
            debug!(
                "cluster {}/{}: skipping roles and databases",
                self.namespace, self.name
            );
        } else {
            self.sync_database_objects().await?;
        }

        debug!("syncing pod disruption budgets");
        self.sync_pod_disruption_budget()
            .await
            .map_err(|e| ControllerError::in_stage("pod disruption budget", e))
    }

    async fn sync_database_objects(&mut self) -> Result<(), ControllerError> {
        debug!("syncing roles");
        self.sync_roles()
            .await
            .map_err(|e| ControllerError::in_stage("roles", e))?;
        debug!("syncing databases");
        self.sync_databases()
            .await
            .map_err(|e| ControllerError::in_stage("databases", e))
    }
}

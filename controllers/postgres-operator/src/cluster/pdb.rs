//! Pod disruption budget convergence.
//!
//! Writes directly (no Actions): create when absent, update in place when the
//! budget specification differs.

use super::compare::same_pdb;
use super::{name_from_meta, Cluster};
use crate::error::ControllerError;
use tracing::{info, warn};

impl Cluster {
    pub(crate) async fn sync_pod_disruption_budget(&mut self) -> Result<(), ControllerError> {
        let store = self.backends.kube.pod_disruption_budgets.clone();
        let name = self.pod_disruption_budget_name();
        let desired = self.generate_pod_disruption_budget();

        match store.get(&name).await {
            Ok(current) => {
                let comparison = same_pdb(&current, &desired);
                if comparison.matches {
                    self.observed.pod_disruption_budget = Some(current);
                    return Ok(());
                }
                info!(
                    "pod disruption budget {} is not in the desired state: {}",
                    name_from_meta(&current.metadata),
                    comparison.reason
                );
                let mut updated = desired;
                updated.metadata.resource_version = current.metadata.resource_version.clone();
                let updated = store.update(&updated).await?;
                info!("updated pod disruption budget {}", name_from_meta(&updated.metadata));
                self.observed.pod_disruption_budget = Some(updated);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.observed.pod_disruption_budget = None;
                info!("could not find the cluster's pod disruption budget");
                match store.create(&desired).await {
                    Ok(pdb) => {
                        info!("created missing pod disruption budget {}", name_from_meta(&pdb.metadata));
                        self.observed.pod_disruption_budget = Some(pdb);
                    }
                    Err(e) if e.is_already_exists() => {
                        info!("pod disruption budget {}/{} already exists", self.namespace, name);
                        match store.get(&name).await {
                            Ok(pdb) => self.observed.pod_disruption_budget = Some(pdb),
                            Err(e) => warn!(
                                "could not fetch existing pod disruption budget {}/{}: {}",
                                self.namespace, name, e
                            ),
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

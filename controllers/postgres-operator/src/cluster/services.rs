//! Service and endpoint convergence.

use super::action::Action;
use super::compare::{same_service, service_type_changed};
use super::{name_from_meta, Cluster, PostgresRole};
use crate::error::ControllerError;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, warn};

impl Cluster {
    /// Ensures both endpoint placeholders exist and returns the service
    /// actions needed for both roles, in role order.
    pub(crate) async fn sync_services(&mut self) -> Result<Vec<Action>, ControllerError> {
        let mut actions = Vec::new();
        for role in PostgresRole::ALL {
            debug!("syncing {} service", role);
            self.sync_endpoint(role).await?;
            actions.extend(self.sync_service(role).await?);
        }
        Ok(actions)
    }

    /// Create-only: an existing endpoint is never modified.
    async fn sync_endpoint(&mut self, role: PostgresRole) -> Result<(), ControllerError> {
        let store = self.backends.kube.endpoints.clone();
        let name = self.endpoint_name(role);

        match store.get(&name).await {
            Ok(endpoint) => {
                self.observed.endpoints.insert(role, endpoint);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                self.observed.endpoints.remove(&role);
            }
            Err(e) => return Err(e.into()),
        }

        info!("could not find {} endpoint {}/{}, creating", role, self.namespace, name);
        let desired = self.generate_endpoint(role);
        match store.create(&desired).await {
            Ok(endpoint) => {
                info!("created missing {} endpoint {}", role, name_from_meta(&endpoint.metadata));
                self.observed.endpoints.insert(role, endpoint);
            }
            Err(e) if e.is_already_exists() => {
                info!("{} endpoint {} already exists", role, name);
                match store.get(&name).await {
                    Ok(endpoint) => {
                        self.observed.endpoints.insert(role, endpoint);
                    }
                    Err(e) => warn!("could not fetch existing {} endpoint {}: {}", role, name, e),
                }
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn sync_service(&mut self, role: PostgresRole) -> Result<Vec<Action>, ControllerError> {
        let name = self.service_name(role);
        let desired = self.generate_service(role);

        let current = match self.backends.kube.services.get(&name).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                self.observed.services.remove(&role);
                info!("could not find {} service {}/{}", role, self.namespace, name);
                return Ok(vec![Action::create_service(role, desired)]);
            }
            Err(e) => return Err(e.into()),
        };
        self.observed.services.insert(role, current.clone());

        let comparison = same_service(&current, &desired);
        if comparison.matches {
            return Ok(Vec::new());
        }
        info!(
            "{} service {} is not in the desired state: {}",
            role,
            name_from_meta(&current.metadata),
            comparison.reason
        );

        if service_type_changed(&current, &desired) {
            return Ok(vec![
                Action::delete_service(role, name, comparison.reason),
                Action::create_service(role, desired),
            ]);
        }
        Ok(vec![Action::update_service(
            role,
            merged_service(&current, desired),
            comparison.reason,
        )])
    }
}

/// Desired service carrying over the fields the backend owns.
fn merged_service(current: &Service, mut desired: Service) -> Service {
    desired.metadata.resource_version = current.metadata.resource_version.clone();
    desired.metadata.uid = current.metadata.uid.clone();
    if let (Some(desired_spec), Some(current_spec)) = (desired.spec.as_mut(), current.spec.as_ref()) {
        desired_spec.cluster_ip = current_spec.cluster_ip.clone();
        desired_spec.cluster_ips = current_spec.cluster_ips.clone();
    }
    desired
}

//! Deferred, named service mutations.
//!
//! Service convergence only decides what to do; the resulting `Action`s are
//! listed (always) and applied (unless in dry-run mode) by the orchestrator,
//! in the order they were produced.

use super::{Cluster, PostgresRole};
use crate::error::StoreError;
use crate::store::{Propagation, ResourceStore};
use k8s_openapi::api::core::v1::Service;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum ActionKind {
    CreateService(Service),
    UpdateService(Service),
    DeleteService(String),
}

/// A service mutation waiting to be applied.
#[derive(Debug, Clone)]
pub struct Action {
    pub role: PostgresRole,
    pub name: String,
    pub reason: Option<String>,
    pub kind: ActionKind,
}

/// What an applied action left behind in the backend.
#[derive(Debug)]
pub enum ActionOutcome {
    Stored(Service),
    Removed,
}

/// Number of actions applied and failed during the last pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
    pub applied: u64,
    pub failed: u64,
}

fn service_name(service: &Service) -> String {
    service.metadata.name.clone().unwrap_or_default()
}

impl Action {
    pub fn create_service(role: PostgresRole, service: Service) -> Self {
        Self {
            role,
            name: format!("create {} service {}", role, service_name(&service)),
            reason: None,
            kind: ActionKind::CreateService(service),
        }
    }

    pub fn update_service(role: PostgresRole, service: Service, reason: String) -> Self {
        Self {
            role,
            name: format!("update {} service {}", role, service_name(&service)),
            reason: Some(reason),
            kind: ActionKind::UpdateService(service),
        }
    }

    pub fn delete_service(role: PostgresRole, name: String, reason: String) -> Self {
        Self {
            role,
            name: format!("delete {} service {}", role, name),
            reason: Some(reason),
            kind: ActionKind::DeleteService(name),
        }
    }

    pub async fn apply(
        &self,
        services: &dyn ResourceStore<Service>,
    ) -> Result<ActionOutcome, StoreError> {
        match &self.kind {
            ActionKind::CreateService(service) => {
                services.create(service).await.map(ActionOutcome::Stored)
            }
            ActionKind::UpdateService(service) => {
                services.update(service).await.map(ActionOutcome::Stored)
            }
            ActionKind::DeleteService(name) => services
                .delete(name, Propagation::Background)
                .await
                .map(|_| ActionOutcome::Removed),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({})", self.name, reason),
            None => f.write_str(&self.name),
        }
    }
}

impl Cluster {
    /// Lists every action, then applies them in order unless in dry-run mode.
    /// Failures are logged and left for the next pass.
    pub(crate) async fn apply_actions(&mut self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        for action in &actions {
            info!("cluster {}/{}: action: {}", self.namespace, self.name, action);
        }
        if self.dry_run() {
            info!(
                "cluster {}/{}: dry-run mode, not applying {} actions",
                self.namespace,
                self.name,
                actions.len()
            );
            return;
        }

        let services = self.backends.kube.services.clone();
        for action in actions {
            match action.apply(services.as_ref()).await {
                Ok(ActionOutcome::Stored(service)) => {
                    self.observed.services.insert(action.role, service);
                    self.action_counts.applied += 1;
                }
                Ok(ActionOutcome::Removed) => {
                    self.observed.services.remove(&action.role);
                    self.action_counts.applied += 1;
                }
                Err(e) if e.is_already_exists() => {
                    info!("could not apply action {}: {}", action.name, e);
                    self.action_counts.failed += 1;
                }
                Err(e) => {
                    warn!("could not apply action {}: {}", action.name, e);
                    self.action_counts.failed += 1;
                }
            }
        }
    }
}

//! Volume capacity convergence.
//!
//! Runs before StatefulSet convergence so a pod restarted against a new
//! definition never comes up on a disk that is still too small. Only growth is
//! supported.

use super::Cluster;
use crate::error::{ControllerError, StoreError};
use crate::store::ResourceStore;
use async_trait::async_trait;
use crds::{format_quantity_bytes, parse_quantity_bytes};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STORAGE: &str = "storage";

/// Grows a volume in place.
#[async_trait]
pub trait VolumeResizer: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Whether this resizer can handle the volume behind the claim.
    fn owns(&self, claim: &PersistentVolumeClaim) -> bool;

    /// Must fail with `ControllerError::Resize` when asked to shrink.
    async fn resize(
        &self,
        volume_id: &str,
        current_bytes: u64,
        desired_bytes: u64,
    ) -> Result<(), ControllerError>;
}

/// Grows volumes by raising the claim's storage request and letting the CSI
/// driver expand the volume.
pub struct PvcResizer {
    claims: Arc<dyn ResourceStore<PersistentVolumeClaim>>,
}

impl PvcResizer {
    pub fn new(claims: Arc<dyn ResourceStore<PersistentVolumeClaim>>) -> Self {
        Self { claims }
    }
}

#[async_trait]
impl VolumeResizer for PvcResizer {
    fn provider(&self) -> &'static str {
        "pvc"
    }

    fn owns(&self, claim: &PersistentVolumeClaim) -> bool {
        claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Bound")
    }

    async fn resize(
        &self,
        volume_id: &str,
        current_bytes: u64,
        desired_bytes: u64,
    ) -> Result<(), ControllerError> {
        if desired_bytes < current_bytes {
            return Err(ControllerError::Resize(format!(
                "cannot shrink {} from {} to {}",
                volume_id,
                format_quantity_bytes(current_bytes),
                format_quantity_bytes(desired_bytes)
            )));
        }

        let mut claim = self.claims.get(volume_id).await?;
        let requested = requested_bytes(&claim)?;
        if requested == Some(desired_bytes) {
            debug!("expansion of {} to {} already requested", volume_id, desired_bytes);
            return Ok(());
        }

        let spec = claim.spec.get_or_insert_with(Default::default);
        let resources = spec.resources.get_or_insert_with(Default::default);
        resources
            .requests
            .get_or_insert_with(Default::default)
            .insert(STORAGE.to_string(), Quantity(format_quantity_bytes(desired_bytes)));
        self.claims.update(&claim).await?;
        Ok(())
    }
}

fn quantity_bytes(claim_name: &str, quantity: &Quantity) -> Result<u64, ControllerError> {
    parse_quantity_bytes(&quantity.0).map_err(|e| {
        ControllerError::Validation(format!("claim {}: {}", claim_name, e))
    })
}

fn requested_bytes(claim: &PersistentVolumeClaim) -> Result<Option<u64>, ControllerError> {
    let name = claim.metadata.name.as_deref().unwrap_or_default();
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE))
        .map(|q| quantity_bytes(name, q))
        .transpose()
}

/// Size of the volume behind a claim: reported capacity, else the request.
pub fn observed_bytes(claim: &PersistentVolumeClaim) -> Result<u64, ControllerError> {
    let name = claim.metadata.name.as_deref().unwrap_or_default();
    let capacity = claim
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(STORAGE));
    match capacity {
        Some(q) => quantity_bytes(name, q),
        None => requested_bytes(claim)?.ok_or_else(|| {
            ControllerError::Validation(format!("claim {} has no storage size", name))
        }),
    }
}

impl Cluster {
    async fn list_persistent_volume_claims(
        &self,
    ) -> Result<Vec<PersistentVolumeClaim>, ControllerError> {
        self.backends
            .kube
            .persistent_volume_claims
            .list(&self.label_selector())
            .await
            .map_err(|e: StoreError| e.into())
    }

    /// Grows every claim of the cluster to the declared size.
    pub(crate) async fn sync_volumes(&mut self) -> Result<(), ControllerError> {
        let desired = parse_quantity_bytes(&self.spec.volume.size).map_err(|e| {
            ControllerError::Validation(format!("volume size {:?}: {}", self.spec.volume.size, e))
        })?;

        let claims = self.list_persistent_volume_claims().await?;
        let mut mismatched = Vec::new();
        for claim in claims {
            let current = observed_bytes(&claim)?;
            if current != desired {
                mismatched.push((claim, current));
            }
        }

        if mismatched.is_empty() {
            debug!("volumes of cluster {}/{} are in sync", self.namespace, self.name);
            return Ok(());
        }

        self.resize_volumes(desired, mismatched).await?;
        info!("volumes of cluster {}/{} have been synced", self.namespace, self.name);
        Ok(())
    }

    async fn resize_volumes(
        &self,
        desired: u64,
        claims: Vec<(PersistentVolumeClaim, u64)>,
    ) -> Result<(), ControllerError> {
        if self.backends.resizers.is_empty() {
            warn!(
                "cluster {}/{}: {} volumes differ from the declared size but no resizer is configured",
                self.namespace,
                self.name,
                claims.len()
            );
            return Ok(());
        }

        for (claim, current) in claims {
            let name = claim.metadata.name.clone().unwrap_or_default();
            if desired < current {
                warn!(
                    "cannot shrink persistent volume {} from {} to {}",
                    name,
                    format_quantity_bytes(current),
                    format_quantity_bytes(desired)
                );
                continue;
            }

            let mut compatible = false;
            for resizer in self.backends.resizers.iter().filter(|r| r.owns(&claim)) {
                compatible = true;
                info!(
                    "resizing volume {} from {} to {} ({})",
                    name,
                    format_quantity_bytes(current),
                    format_quantity_bytes(desired),
                    resizer.provider()
                );
                resizer.resize(&name, current, desired).await?;
            }
            if !compatible {
                warn!(
                    "volume {} is incompatible with all available resizing providers",
                    name
                );
            }
        }
        Ok(())
    }
}

//! Writes to the `PostgresCluster` status sub-resource.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::PostgresCluster;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Applies a JSON merge patch to the status of one cluster.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), ControllerError>;
}

pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), ControllerError> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

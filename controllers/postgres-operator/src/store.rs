//! Resource store abstraction over the Kubernetes API.
//!
//! Convergence code talks to `ResourceStore<K>` instead of `kube::Api<K>` so
//! that 404/409 outcomes arrive as `StoreError` variants and the whole core
//! can be exercised against the in-memory store in `test_utils`.

use crate::error::StoreError;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// What happens to dependents when an owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Background,
    /// Dependents (e.g. pods of a StatefulSet) survive the deletion
    Orphan,
}

/// Read-compare-write operations the reconciler needs on one resource kind.
#[async_trait::async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError>;
    async fn create(&self, object: &K) -> Result<K, StoreError>;
    async fn update(&self, object: &K) -> Result<K, StoreError>;
    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), StoreError>;
    async fn list(&self, label_selector: &str) -> Result<Vec<K>, StoreError>;
}

/// `ResourceStore` backed by a namespaced `kube::Api`.
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.api
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), name, e))
    }

    async fn create(&self, object: &K) -> Result<K, StoreError> {
        let name = object_name(object);
        debug!("creating {} {}", K::kind(&()), name);
        self.api
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), &name, e))
    }

    async fn update(&self, object: &K) -> Result<K, StoreError> {
        let name = object_name(object);
        debug!("replacing {} {}", K::kind(&()), name);
        self.api
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), &name, e))
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), StoreError> {
        let params = DeleteParams {
            propagation_policy: Some(match propagation {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..DeleteParams::default()
        };
        self.api
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(&K::kind(&()), name, e))
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, StoreError> {
        self.api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(&K::kind(&()), label_selector, e))
    }
}

//! Mock PatroniClient for unit testing
//!
//! Records every parameter push and can be told to reject pushes for
//! specific pods, so callers can exercise their per-pod fallback logic.

use crate::error::PatroniError;
use crate::models::PodEndpoint;
use crate::patroni_trait::PatroniClientTrait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// Mock PatroniClient for testing
#[derive(Clone, Default)]
pub struct MockPatroniClient {
    pub(crate) calls: Arc<Mutex<Vec<(String, BTreeMap<String, String>)>>>,
    pub(crate) failing_pods: Arc<Mutex<HashSet<String>>>,
}

impl MockPatroniClient {
    /// Create a new mock client that accepts every push
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pushes through the named pod fail (for test setup)
    pub fn fail_for_pod(&self, pod_name: impl Into<String>) {
        self.failing_pods.lock().unwrap().insert(pod_name.into());
    }

    /// Every attempted push as (pod name, parameters), in order
    pub fn calls(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Pushes that were accepted
    pub fn accepted(&self) -> Vec<(String, BTreeMap<String, String>)> {
        let failing = self.failing_pods.lock().unwrap().clone();
        self.calls()
            .into_iter()
            .filter(|(pod, _)| !failing.contains(pod))
            .collect()
    }
}

#[async_trait::async_trait]
impl PatroniClientTrait for MockPatroniClient {
    async fn set_postgres_parameters(
        &self,
        pod: &PodEndpoint,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), PatroniError> {
        self.calls
            .lock()
            .unwrap()
            .push((pod.name.clone(), parameters.clone()));

        if self.failing_pods.lock().unwrap().contains(&pod.name) {
            return Err(PatroniError::Api(format!(
                "PATCH http://{}/config failed: 503 Service Unavailable",
                pod.ip
            )));
        }
        Ok(())
    }
}

//! Patroni API client
//!
//! Talks to the Patroni REST API exposed by each database pod
//! (`http://<pod-ip>:<port>`).

use crate::error::PatroniError;
use crate::models::{ConfigPatch, PodEndpoint};
use crate::patroni_trait::PatroniClientTrait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Patroni API client
pub struct PatroniClient {
    client: Client,
    port: u16,
}

impl PatroniClient {
    /// Create a new Patroni client
    ///
    /// # Arguments
    /// * `port` - Patroni API port on every pod (8008 by default in Spilo)
    pub fn new(port: u16) -> Result<Self, PatroniError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(PatroniError::Http)?;

        Ok(Self { client, port })
    }

    /// Base URL of the Patroni API of a pod
    pub fn api_url(&self, pod: &PodEndpoint) -> Result<String, PatroniError> {
        if pod.ip.is_empty() {
            return Err(PatroniError::NoPodIp(pod.name.clone()));
        }
        if pod.ip.contains(':') {
            Ok(format!("http://[{}]:{}", pod.ip, self.port))
        } else {
            Ok(format!("http://{}:{}", pod.ip, self.port))
        }
    }
}

#[async_trait::async_trait]
impl PatroniClientTrait for PatroniClient {
    async fn set_postgres_parameters(
        &self,
        pod: &PodEndpoint,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), PatroniError> {
        let url = format!("{}/config", self.api_url(pod)?);
        let body = serde_json::to_vec(&ConfigPatch::parameters(parameters))?;
        debug!("PATCH {} ({} parameters)", url, parameters.len());

        let response = self
            .client
            .patch(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(PatroniError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PatroniError::Api(format!(
                "PATCH {} failed: {} - {}",
                url, status, body
            )));
        }

        Ok(())
    }
}

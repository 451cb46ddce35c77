//! PatroniClient trait for mocking
//!
//! The concrete PatroniClient implements this trait, and tests can use
//! `MockPatroniClient` (feature `test-util`).

use crate::error::PatroniError;
use crate::models::PodEndpoint;
use std::collections::BTreeMap;

/// Trait for Patroni API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PatroniClientTrait: Send + Sync {
    /// Patches `postgresql.parameters` of the cluster-wide dynamic configuration
    /// through the Patroni API of the given pod.
    async fn set_postgres_parameters(
        &self,
        pod: &PodEndpoint,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), PatroniError>;
}

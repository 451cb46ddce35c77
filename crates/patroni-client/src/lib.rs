//! Patroni REST API Client
//!
//! A small client for the Patroni sidecar API running next to every
//! PostgreSQL pod. The operator uses it to push cluster-wide parameters that
//! Patroni only accepts through its dynamic configuration endpoint.
//!
//! # Example
//!
//! ```no_run
//! use patroni_client::{PatroniClient, PatroniClientTrait, PodEndpoint};
//! use std::collections::BTreeMap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PatroniClient::new(8008)?;
//! let pod = PodEndpoint::new("acid-minimal-0", "10.2.0.14");
//!
//! let mut parameters = BTreeMap::new();
//! parameters.insert("max_connections".to_string(), "200".to_string());
//! client.set_postgres_parameters(&pod, &parameters).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod patroni_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::PatroniClient;
pub use error::PatroniError;
pub use models::*;
pub use patroni_trait::PatroniClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockPatroniClient;

//! Patroni client errors

use thiserror::Error;

/// Errors that can occur when talking to the Patroni API
#[derive(Debug, Error)]
pub enum PatroniError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Patroni answered with a non-success status
    #[error("Patroni API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The pod has no IP address yet
    #[error("Pod {0} has no IP address")]
    NoPodIp(String),
}

//! pgops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the PostgreSQL operator.

pub mod postgres_cluster;
pub mod quantity;

pub use postgres_cluster::*;
pub use quantity::*;

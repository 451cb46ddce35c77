//! Controller-specific error types.
//!
//! `StoreError` classifies cluster-backend failures into the outcomes the
//! convergence code branches on (absence, creation races, everything else).
//! `ControllerError` is what every stage returns.

use kube::Error as KubeError;
use patroni_client::PatroniError;
use thiserror::Error;

/// Outcome of a resource-store call that did not succeed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Expected absence; drives the create path
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// Expected creation race; drives the adopt path
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Kubernetes API error other than 404/409
    #[error("Kubernetes error: {0}")]
    Kube(#[source] KubeError),

    /// Backend failure not originating from the Kubernetes client
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Classifies a kube error for the named object.
    pub fn from_kube(kind: &str, name: &str, error: KubeError) -> Self {
        match error {
            KubeError::Api(ae) if ae.code == 404 => StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            KubeError::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            other => StoreError::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Errors that can occur in the PostgreSQL operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resource store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Kubernetes API error outside the resource stores
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Patroni API error
    #[error("Patroni error: {0}")]
    Patroni(#[from] PatroniError),

    /// Database driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Desired object could not be generated from the cluster spec
    #[error("validation failed: {0}")]
    Validation(String),

    /// Readiness or parameter-push budget exhausted
    #[error("convergence timeout: {0}")]
    ConvergenceTimeout(String),

    /// Volume resize refused or failed
    #[error("volume resize failed: {0}")]
    Resize(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Adding or removing the cluster finalizer failed
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ControllerError>>),

    /// A sync stage failed; carries the stage name for context
    #[error("could not sync {stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ControllerError>,
    },
}

impl ControllerError {
    /// Wraps an error with the name of the stage that produced it.
    pub fn in_stage(stage: &'static str, source: ControllerError) -> Self {
        ControllerError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// True when the root cause is an "already exists" race.
    pub fn is_already_exists(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_already_exists(),
            ControllerError::Stage { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    /// True when the root cause is an expected absence.
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_not_found(),
            ControllerError::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Name of the outermost failed stage, if any.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            ControllerError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

//! Helper functions for common reconciliation patterns
//!
//! Bounded polling used by every readiness wait, and the status patch
//! helpers used by the reconciler.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::{ClusterPhase, PostgresClusterStatus};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Polls `check` every `interval` until it returns `true`.
///
/// Errors from `check` end the wait immediately. Exhausting `timeout`
/// returns `ControllerError::ConvergenceTimeout` naming `what`.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut check: F,
) -> Result<(), ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ControllerError>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if check().await? {
            debug!("{} after {} attempts", what, attempts);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ControllerError::ConvergenceTimeout(format!(
                "timed out after {:?} waiting until {}",
                timeout, what
            )));
        }
        sleep(interval).await;
    }
}

/// Check if the cluster status needs to be patched.
///
/// Only a phase change counts; the error message of a repeated failure and
/// the transition time never trigger a patch on their own.
pub fn status_needs_update(
    current_status: Option<&PostgresClusterStatus>,
    desired_phase: ClusterPhase,
) -> bool {
    match current_status {
        None => true,
        Some(status) => status.phase != desired_phase,
    }
}

/// Merge patch for the status sub-resource.
///
/// A missing error is sent as `null` so a recovered cluster drops the
/// message of its last failure.
pub fn create_status_patch(
    phase: ClusterPhase,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> serde_json::Value {
    let mut status = serde_json::json!(PostgresClusterStatus {
        phase,
        last_transition_time: Some(now),
        error: error.map(str::to_string),
    });
    if error.is_none() {
        status["error"] = serde_json::Value::Null;
    }
    serde_json::json!({ "status": status })
}

//! Prometheus metrics and the probe/metrics HTTP server.

use crate::cluster::action::ActionCounts;
use crate::error::ControllerError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Operator metrics, all registered on one registry.
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    /// Completed sync passes by outcome (`success`, `failure`)
    pub syncs_total: IntCounterVec,
    /// Failed sync passes by the stage that failed
    pub sync_stage_failures_total: IntCounterVec,
    /// Service actions by outcome (`applied`, `failed`)
    pub service_actions_total: IntCounterVec,
    /// Duration of sync passes
    pub sync_duration_seconds: HistogramVec,
    /// Clusters currently held in the registry
    pub managed_clusters: IntGauge,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl OperatorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pgops".to_string()), None)?;

        let syncs_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("syncs_total", "Cluster sync passes by outcome"),
                &["outcome"],
            )?,
        )?;
        let sync_stage_failures_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("sync_stage_failures_total", "Failed sync passes by stage"),
                &["stage"],
            )?,
        )?;
        let service_actions_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("service_actions_total", "Service actions by outcome"),
                &["outcome"],
            )?,
        )?;
        let sync_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("sync_duration_seconds", "Duration of cluster sync passes")
                    .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
                &["outcome"],
            )?,
        )?;
        let managed_clusters = register(
            &registry,
            IntGauge::new("managed_clusters", "Clusters held by the operator")?,
        )?;

        Ok(Self {
            registry,
            syncs_total,
            sync_stage_failures_total,
            service_actions_total,
            sync_duration_seconds,
            managed_clusters,
        })
    }

    /// Records the outcome of one sync pass.
    pub fn observe_sync(
        &self,
        elapsed: Duration,
        result: &Result<(), ControllerError>,
        actions: ActionCounts,
    ) {
        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.syncs_total.with_label_values(&[outcome]).inc();
        self.sync_duration_seconds
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
        if let Err(e) = result {
            self.sync_stage_failures_total
                .with_label_values(&[e.stage().unwrap_or("unknown")])
                .inc();
        }
        self.service_actions_total
            .with_label_values(&["applied"])
            .inc_by(actions.applied);
        self.service_actions_total
            .with_label_values(&["failed"])
            .inc_by(actions.failed);
    }

    /// Metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared state of the probe server.
#[derive(Clone)]
pub struct ProbeState {
    pub metrics: Arc<OperatorMetrics>,
    pub ready: Arc<AtomicBool>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}

async fn metrics_handler(State(state): State<ProbeState>) -> Response {
    match state.metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the probe endpoints until the process exits.
pub async fn serve(addr: &str, state: ProbeState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ControllerError::InvalidConfig(format!("could not listen on {}: {}", addr, e))
    })?;
    info!("serving probes and metrics on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Watch(format!("probe server failed: {}", e)))
}

//! Local health endpoints for probes and scraping.
//!
//! - `/health`, `/healthz` - liveness
//! - `/ready`, `/readyz` - readiness
//! - `/status` - node load snapshot
//! - `/metrics` - Prometheus exposition

use crate::gpu::GpuTracker;
use crate::metrics;
use crate::runner::RunnerStats;
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Shared state for the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    pub node_id: String,
    pub stats: Arc<RunnerStats>,
    pub gpus: Arc<GpuTracker>,
}

impl HealthState {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        node_id: impl Into<String>,
        stats: Arc<RunnerStats>,
        gpus: Arc<GpuTracker>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            node_id: node_id.into(),
            stats,
            gpus,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
    pub node_id: String,
}

/// Liveness probe: OK whenever the process is serving.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
        node_id: state.node_id,
    })
}

/// Readiness probe.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "inFlight": state.stats.in_flight(),
        })),
    )
}

/// Node load snapshot, mirroring the published status envelope.
pub async fn status_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "nodeId": state.node_id,
        "inFlight": state.stats.in_flight(),
        "slots": {
            "total": state.gpus.total_slots(),
            "leased": state.gpus.leased(),
        },
    }))
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with the standard probe and metrics endpoints.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler_shape() {
        let state = HealthState::new(
            "citadel_agent",
            "0.1.0",
            "n1",
            Arc::new(RunnerStats::default()),
            GpuTracker::new(0),
        );

        let Json(response) = health_handler(State(state)).await;
        assert_eq!(response.status, "healthy");
        assert_eq!(response.name, "citadel_agent");
        assert_eq!(response.node_id, "n1");
    }

    #[tokio::test]
    async fn test_status_handler_reports_slots() {
        let state = HealthState::new(
            "citadel_agent",
            "0.1.0",
            "n1",
            Arc::new(RunnerStats::default()),
            GpuTracker::new(2),
        );

        let Json(value) = status_handler(State(state)).await;
        assert_eq!(value["slots"]["total"], 2);
        assert_eq!(value["slots"]["leased"], 0);
        assert_eq!(value["inFlight"], 0);
    }
}

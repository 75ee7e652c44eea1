//! Local admin endpoints: metrics, health, the node view and recent
//! reconciliations.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::debug;

use crate::{
    provider::{FleetBridge, NodeProvider},
    telemetry,
};

pub fn router(bridge: FleetBridge, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/node", get(node))
        .route("/reconciliations", get(reconciliations))
        .route("/disconnected", get(disconnected))
        .with_state(bridge)
        .merge(telemetry::metrics_router(metrics))
}

async fn healthz(State(bridge): State<FleetBridge>) -> Response {
    match bridge.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(err) => {
            debug!(?err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn node(State(bridge): State<FleetBridge>) -> Response {
    Json(bridge.get_node().await).into_response()
}

async fn reconciliations(State(bridge): State<FleetBridge>) -> Response {
    Json(bridge.reconciliations().await).into_response()
}

async fn disconnected(State(bridge): State<FleetBridge>) -> Response {
    Json(bridge.disconnected_devices().await).into_response()
}

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{Router, http::StatusCode, routing::get};
use metrics::histogram;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

/// Register an existing Prometheus handle without installing a new recorder.
/// Useful when embedding the bridge into a binary that already installed a
/// global recorder.
pub fn register_metrics_handle(handle: PrometheusHandle) -> PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| handle).clone()
}

/// Router exposing the Prometheus text format on `/metrics`.
pub fn metrics_router<S>(handle: PrometheusHandle) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    )
}

pub async fn serve_with_shutdown<F>(
    app: Router,
    addr: SocketAddr,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "admin server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_reconcile(operation: &str, result: &str, duration: Duration) {
    counter!(
        "fleet_bridge_reconcile_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        "fleet_bridge_reconcile_duration_ms",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_status_poll(result: &str) {
    counter!(
        "fleet_bridge_status_poll_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_mapped_workloads(count: usize) {
    gauge!("fleet_bridge_mapped_workloads").set(count as f64);
}

pub fn record_backend_request(method: &str, result: &str) {
    counter!(
        "fleet_bridge_backend_requests_total",
        "method" => method.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_token_refresh(result: &str) {
    counter!(
        "fleet_bridge_token_refresh_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_device_transition(to: &str) {
    counter!(
        "fleet_bridge_device_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_timeout_evictions(count: usize) {
    counter!("fleet_bridge_timeout_evictions_total").increment(count as u64);
}

pub fn set_registry_devices(count: usize) {
    gauge!("fleet_bridge_registry_devices").set(count as f64);
}

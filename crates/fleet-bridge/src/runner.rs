use std::{net::SocketAddr, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{
    admin,
    backend::{BackendClient, DynFleetBackend, TokenManager},
    build_client, config,
    provider::FleetBridge,
    reconcile::reconcile_loop,
    state, telemetry, validate_backend_urls, version,
};

/// Controls optional behaviours when starting the bridge programmatically.
#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Initialize a tracing subscriber before starting the bridge.
    pub init_tracing: bool,
    /// Start the admin HTTP server (`/metrics`, `/healthz`, ...).
    pub serve_admin: bool,
    /// Reuse an existing Prometheus recorder instead of installing a new one.
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_admin: true,
            metrics_handle: None,
        }
    }
}

/// Handle returned by [`start_bridge`] to reach the bridge and manage
/// shutdown when embedded.
pub struct BridgeHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    bridge: FleetBridge,
}

impl BridgeHandle {
    /// The orchestrator-facing provider.
    pub fn bridge(&self) -> &FleetBridge {
        &self.bridge
    }

    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all bridge tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "bridge task panicked during shutdown");
                    anyhow::bail!("bridge task panicked");
                }
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the bridge against the configured backend.
///
/// When embedding the bridge into a process that already owns telemetry, pass
/// `BridgeOptions { init_tracing: false, serve_admin: false, metrics_handle:
/// Some(existing_handle) }`.
pub async fn start_bridge(
    cfg: config::AppConfig,
    options: BridgeOptions,
) -> anyhow::Result<BridgeHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }
    validate_backend_urls(&cfg)?;

    let client = build_client(&cfg)?;
    let tokens = Arc::new(TokenManager::new(
        client.clone(),
        cfg.token_url.clone(),
        cfg.client_id.clone(),
        cfg.client_secret.clone(),
        cfg.token_expiry_margin(),
    ));
    let backend: DynFleetBackend = Arc::new(BackendClient::new(&cfg.backend_url, client, tokens));
    start_with_backend(cfg, backend, options).await
}

/// Start the bridge over an already constructed backend.
pub async fn start_with_backend(
    cfg: config::AppConfig,
    backend: DynFleetBackend,
    mut options: BridgeOptions,
) -> anyhow::Result<BridgeHandle> {
    let metrics_handle = match options.metrics_handle.take() {
        Some(handle) => telemetry::register_metrics_handle(handle),
        None => telemetry::init_metrics_recorder(),
    };
    let admin_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid admin bind address: {}", err))?;

    info!(
        node = %cfg.node_name,
        backend = %cfg.backend_url,
        insecure_http = cfg.allow_insecure_http,
        tls_skip_verify = cfg.tls_insecure_skip_verify,
        default_device = cfg.default_device_id.as_deref().unwrap_or("-"),
        reconnect_timeout_secs = cfg.reconnect_timeout_secs,
        version = version::VERSION,
        git_sha = version::GIT_SHA,
        built_at = version::BUILD_TIMESTAMP,
        "fleet bridge starting"
    );

    let state = state::new_state(cfg, backend);
    let bridge = FleetBridge::new(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_admin {
        let app = admin::router(bridge.clone(), metrics_handle);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) = telemetry::serve_with_shutdown(app, admin_addr, shutdown_fut).await {
                error!(?err, "admin server exited with error");
            }
        }));
    }

    let rc_state = state.clone();
    let shutdown_rx_reconcile = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = reconcile_loop(rc_state, shutdown_rx_reconcile).await {
            error!(?err, "reconcile loop terminated with error");
        }
    }));

    Ok(BridgeHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
        bridge,
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeBackend, base_config};

    fn dummy_bridge() -> FleetBridge {
        FleetBridge::new(state::new_state(
            base_config(),
            Arc::new(FakeBackend::default()),
        ))
    }

    #[test]
    fn bridge_options_defaults() {
        let opts = BridgeOptions::default();
        assert!(opts.init_tracing);
        assert!(opts.serve_admin);
        assert!(opts.metrics_handle.is_none());
    }

    #[tokio::test]
    async fn bridge_handle_request_shutdown_sets_signal() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = BridgeHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
            bridge: dummy_bridge(),
        };

        handle.request_shutdown();
        assert!(*handle.shutdown_signal().borrow());
    }

    #[tokio::test]
    async fn bridge_handle_reports_task_panics() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async {
            panic!("boom");
        });
        let handle = BridgeHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: vec![task],
            bridge: dummy_bridge(),
        };

        let err = handle.await_termination().await.expect_err("panic");
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn start_bridge_rejects_plain_http_without_opt_in() {
        let mut cfg = base_config();
        cfg.allow_insecure_http = false;
        let options = BridgeOptions {
            init_tracing: false,
            serve_admin: false,
            metrics_handle: None,
        };
        let err = start_bridge(cfg, options).await.err().expect("rejected");
        assert!(err.to_string().contains("insecure"));
    }
}

use fleet_bridge::{
    NodeProvider, config,
    runner::{self, BridgeOptions},
    telemetry,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;

    let handle = runner::start_bridge(
        cfg,
        BridgeOptions {
            init_tracing: false,
            ..BridgeOptions::default()
        },
    )
    .await?;

    let bridge = handle.bridge().clone();
    match bridge.ping().await {
        Ok(()) => info!("backend reachable"),
        Err(err) => warn!(error = %err, "backend not reachable at startup; will keep retrying"),
    }
    let node = bridge.get_node().await;
    info!(
        node = %node.name,
        ready_devices = node.ready_devices,
        total_devices = node.total_devices,
        cpu = %node.allocatable.cpu,
        memory = %node.allocatable.memory,
        "virtual node registered"
    );

    runner::wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping bridge");
    handle.shutdown().await
}

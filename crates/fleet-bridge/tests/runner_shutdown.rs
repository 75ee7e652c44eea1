use std::time::Duration;

use fleet_bridge::{
    NodeProvider,
    runner::{self, BridgeOptions},
};

mod support;

#[tokio::test]
async fn embedded_shutdown_finishes_with_admin_enabled() {
    let backend = support::backend(vec![support::device_doc("dev-1", "Online", "4", "8Gi")]);

    let handle = runner::start_with_backend(
        support::config(),
        backend,
        BridgeOptions {
            // Avoid global tracing subscriber conflicts in tests.
            init_tracing: false,
            serve_admin: true,
            metrics_handle: None,
        },
    )
    .await
    .expect("bridge starts");

    // The first registry refresh runs right away.
    let bridge = handle.bridge().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.get_node().await.total_devices == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry populated");

    let shutdown = tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await;
    let res = shutdown.expect("shutdown should complete within timeout");
    res.expect("shutdown should succeed");
}

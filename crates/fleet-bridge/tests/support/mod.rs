#![allow(dead_code)]

use std::sync::Arc;

use common::api::DeviceDocument;
use fleet_bridge::{config::AppConfig, test_support, workload::Workload};

pub use fleet_bridge::test_support::{FakeBackend, device_doc};

pub fn config() -> AppConfig {
    let mut cfg = test_support::base_config();
    cfg.node_name = "fleet-bridge-itest".into();
    // Let the OS pick an ephemeral port to avoid collisions in CI.
    cfg.metrics_port = 0;
    cfg
}

pub fn backend(docs: Vec<DeviceDocument>) -> Arc<FakeBackend> {
    let backend = Arc::new(FakeBackend::default());
    for doc in docs {
        backend.put_device(doc);
    }
    backend
}

/// Workload pinned to `device_id` with a 64Mi memory request.
pub fn workload_on(name: &str, device_id: &str, cpu_millis: u64) -> Workload {
    test_support::workload_on(name, device_id, cpu_millis, 64 << 20)
}

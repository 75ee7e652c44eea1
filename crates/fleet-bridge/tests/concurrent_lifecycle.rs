use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_bridge::{FleetBridge, NodeProvider, WorkloadLifecycle, state, workload::WorkloadKey};
use tokio::task::JoinSet;

mod support;

fn bridge() -> (FleetBridge, Arc<support::FakeBackend>) {
    let backend = support::backend(vec![
        support::device_doc("dev-1", "Online", "4", "8Gi"),
        support::device_doc("dev-2", "Online", "4", "8Gi"),
    ]);
    let bridge = FleetBridge::new(state::new_state(support::config(), backend.clone()));
    (bridge, backend)
}

fn device_for(i: usize) -> &'static str {
    if i % 2 == 0 { "dev-1" } else { "dev-2" }
}

fn sorted(mut apps: Vec<String>) -> Vec<String> {
    apps.sort();
    apps
}

#[tokio::test]
async fn parallel_creates_on_distinct_keys_all_land() {
    let (bridge, backend) = bridge();
    bridge.refresh_devices().await;

    let mut set = JoinSet::new();
    for i in 0..8 {
        let bridge = bridge.clone();
        set.spawn(async move {
            bridge
                .create_workload(support::workload_on(&format!("web-{i}"), device_for(i), 250))
                .await
        });
    }
    while let Some(res) = set.join_next().await {
        res.expect("task").expect("create");
    }

    assert_eq!(bridge.list_workloads().await.len(), 8);
    assert_eq!(backend.declared_apps("dev-1").len(), 4);
    assert_eq!(backend.declared_apps("dev-2").len(), 4);

    let node = bridge.get_node().await;
    assert_eq!(node.total_devices, 2);
    assert_eq!(node.allocatable.pods, 2 * 110 - 8);
}

#[tokio::test]
async fn interleaved_creates_and_deletes_keep_the_table_consistent() {
    let (bridge, backend) = bridge();
    bridge.refresh_devices().await;
    for i in 0..6 {
        bridge
            .create_workload(support::workload_on(&format!("old-{i}"), device_for(i), 250))
            .await
            .expect("create");
    }

    let mut set = JoinSet::new();
    for i in 0..6 {
        let creator = bridge.clone();
        set.spawn(async move {
            creator
                .create_workload(support::workload_on(&format!("new-{i}"), device_for(i), 250))
                .await
        });
        let deleter = bridge.clone();
        set.spawn(async move {
            let key = WorkloadKey::new("default", format!("old-{i}"));
            deleter.delete_workload(&key).await
        });
    }
    while let Some(res) = set.join_next().await {
        res.expect("task").expect("operation");
    }

    let mapped: BTreeSet<String> = bridge
        .list_workloads()
        .await
        .into_iter()
        .map(|managed| managed.workload.name)
        .collect();
    let expected: BTreeSet<String> = (0..6).map(|i| format!("new-{i}")).collect();
    assert_eq!(mapped, expected);

    assert_eq!(
        sorted(backend.declared_apps("dev-1")),
        vec!["default-new-0", "default-new-2", "default-new-4"]
    );
    assert_eq!(
        sorted(backend.declared_apps("dev-2")),
        vec!["default-new-1", "default-new-3", "default-new-5"]
    );
    for managed in bridge.list_workloads().await {
        let i: usize = managed.workload.name["new-".len()..]
            .parse()
            .expect("index");
        assert_eq!(managed.device_id, device_for(i));
    }
}

#[tokio::test]
async fn parallel_deletes_leave_nothing_behind() {
    let (bridge, backend) = bridge();
    bridge.refresh_devices().await;
    for i in 0..4 {
        bridge
            .create_workload(support::workload_on(&format!("web-{i}"), "dev-1", 250))
            .await
            .expect("create");
    }

    let mut set = JoinSet::new();
    for i in 0..4 {
        let bridge = bridge.clone();
        set.spawn(async move {
            let key = WorkloadKey::new("default", format!("web-{i}"));
            bridge.delete_workload(&key).await
        });
    }
    while let Some(res) = set.join_next().await {
        res.expect("task").expect("delete");
    }

    assert!(bridge.list_workloads().await.is_empty());
    assert!(backend.declared_apps("dev-1").is_empty());
}

#[tokio::test]
async fn deleting_twice_is_harmless() {
    let (bridge, backend) = bridge();
    bridge.refresh_devices().await;
    bridge
        .create_workload(support::workload_on("web", "dev-2", 250))
        .await
        .expect("create");
    let puts = backend.put_calls();

    let key = WorkloadKey::new("default", "web");
    bridge.delete_workload(&key).await.expect("first delete");
    bridge.delete_workload(&key).await.expect("second delete");

    assert_eq!(backend.put_calls(), puts + 1);
    assert!(bridge.get_workload(&key).await.is_err());
}

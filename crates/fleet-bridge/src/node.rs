//! The single virtual node presented to the orchestrator.
//!
//! Capacity is the sum over devices that are ready and connected; allocatable
//! subtracts what mapped workloads have already committed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::AppConfig,
    models::{Device, ResourceList},
    quantity::{format_cpu, format_memory},
    selector::LoadMap,
    state::{self, SharedState},
    version,
};

pub const PODS_PER_DEVICE: u64 = 110;
pub const EDGE_TAINT_KEY: &str = "fleet-bridge.io/edge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeResources {
    pub cpu: String,
    pub memory: String,
    pub pods: u64,
    #[serde(skip)]
    pub raw: ResourceList,
}

impl NodeResources {
    fn new(raw: ResourceList, pods: u64) -> Self {
        Self {
            cpu: format_cpu(raw.cpu_millis),
            memory: format_memory(raw.memory_bytes),
            pods,
            raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub bridge_version: String,
    pub git_sha: String,
    pub operating_system: String,
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity: NodeResources,
    pub allocatable: NodeResources,
    pub conditions: Vec<NodeCondition>,
    pub ready_devices: usize,
    pub total_devices: usize,
    pub info: NodeInfo,
    #[serde(skip)]
    pub generated_at: DateTime<Utc>,
}

impl NodeDescriptor {
    /// Whether `other` differs by more than `noise` in any resource, or in the
    /// set of counted devices.
    pub fn differs_from(&self, other: &NodeDescriptor, noise: ResourceList) -> bool {
        fn beyond(a: ResourceList, b: ResourceList, noise: ResourceList) -> bool {
            a.cpu_millis.abs_diff(b.cpu_millis) > noise.cpu_millis
                || a.memory_bytes.abs_diff(b.memory_bytes) > noise.memory_bytes
        }
        self.ready_devices != other.ready_devices
            || self.total_devices != other.total_devices
            || self.allocatable.pods != other.allocatable.pods
            || self.labels != other.labels
            || beyond(self.capacity.raw, other.capacity.raw, noise)
            || beyond(self.allocatable.raw, other.allocatable.raw, noise)
    }
}

/// Builds the node from a device listing and the committed load per device.
pub fn build_node(cfg: &AppConfig, devices: &[Device], loads: &LoadMap) -> NodeDescriptor {
    let ready: Vec<&Device> = devices.iter().filter(|d| d.is_schedulable()).collect();

    let mut capacity = ResourceList::ZERO;
    let mut allocatable = ResourceList::ZERO;
    let mut placed: u64 = 0;
    for device in &ready {
        capacity = capacity.saturating_add(device.capacity);
        let load = loads.get(&device.id);
        allocatable = allocatable.saturating_add(crate::selector::available(device, load));
        placed += load.map(|l| l.workloads as u64).unwrap_or(0);
    }
    let pods = PODS_PER_DEVICE * ready.len() as u64;

    let mut labels: BTreeMap<String, String> = BTreeMap::from([
        ("type".to_string(), "virtual-kubelet".to_string()),
        ("kubernetes.io/role".to_string(), "agent".to_string()),
        ("kubernetes.io/hostname".to_string(), cfg.node_name.clone()),
    ]);
    labels.extend(sorted(&cfg.node_labels));

    NodeDescriptor {
        name: cfg.node_name.clone(),
        labels,
        taints: vec![Taint {
            key: EDGE_TAINT_KEY.to_string(),
            value: "true".to_string(),
            effect: "NoSchedule".to_string(),
        }],
        capacity: NodeResources::new(capacity, pods),
        allocatable: NodeResources::new(allocatable, pods.saturating_sub(placed)),
        conditions: vec![NodeCondition {
            kind: "Ready".to_string(),
            status: "True".to_string(),
            reason: "BridgeReady".to_string(),
            message: format!("{} of {} devices ready", ready.len(), devices.len()),
        }],
        ready_devices: ready.len(),
        total_devices: devices.len(),
        info: NodeInfo {
            bridge_version: version::VERSION.to_string(),
            git_sha: version::GIT_SHA.to_string(),
            operating_system: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        },
        generated_at: Utc::now(),
    }
}

fn sorted(labels: &HashMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub async fn get_node(state: &SharedState) -> NodeDescriptor {
    let devices = state.registry().devices().await;
    let loads = state::committed_loads(state, None).await;
    build_node(state.cfg(), &devices, &loads)
}

/// Reports the node to the registered notifier when it changed beyond the
/// configured noise, or unconditionally when `force` is set. Returns whether a
/// report was sent.
pub async fn maybe_notify_node(state: &SharedState, force: bool) -> bool {
    let node = get_node(state).await;
    let notifier = {
        let mut guard = state.lock().await;
        let changed = force
            || guard
                .last_node_report
                .as_ref()
                .is_none_or(|previous| node.differs_from(previous, state.cfg().capacity_noise()));
        if !changed {
            return false;
        }
        guard.last_node_report = Some(node.clone());
        guard.node_notifier.clone()
    };
    debug!(
        ready_devices = node.ready_devices,
        cpu = %node.allocatable.cpu,
        memory = %node.allocatable.memory,
        "node status changed"
    );
    match notifier {
        Some(notify) => {
            notify(node);
            true
        }
        None => false,
    }
}

//! Orchestrator-facing surface of the bridge.
//!
//! [`FleetBridge`] implements the workload lifecycle and the node provider
//! over the shared state. Notifications are delivered through plain callbacks
//! registered once by the embedding orchestrator adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    error::BridgeError,
    node::{self, NodeDescriptor},
    reconcile::{
        self, ReconcileOutcome,
        audit::{self, ReconciliationRecord},
        disconnect::{self, TrackerInfo},
        placement, removal, replace,
        resync::{self, ResyncSummary},
        status_poll::{self, PollSummary},
    },
    state::{self, PodDeviceMapping, SharedState},
    workload::{PodStatus, Workload, WorkloadKey},
};

/// A workload together with where it runs and what is known about it.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedWorkload {
    pub workload: Workload,
    pub device_id: String,
    pub status: Option<PodStatus>,
}

impl ManagedWorkload {
    pub fn from_mapping(mapping: &PodDeviceMapping) -> Self {
        Self {
            workload: mapping.workload.clone(),
            device_id: mapping.device_id.clone(),
            status: mapping.status.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PodEvent {
    StatusChanged(ManagedWorkload),
    /// The workload was removed because its device stayed unreachable.
    Evicted {
        key: WorkloadKey,
        uid: String,
        device_id: String,
        status: PodStatus,
    },
}

pub type PodNotifier = Arc<dyn Fn(PodEvent) + Send + Sync>;
pub type NodeNotifier = Arc<dyn Fn(NodeDescriptor) + Send + Sync>;

/// Lists the workloads the orchestrator currently assigns to this node. Used
/// by the full resync.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn list_workloads(&self) -> anyhow::Result<Vec<Workload>>;
}

pub type DynWorkloadSource = Arc<dyn WorkloadSource>;

#[async_trait]
pub trait WorkloadLifecycle: Send + Sync {
    async fn create_workload(&self, workload: Workload) -> Result<(), BridgeError>;
    async fn update_workload(&self, workload: Workload) -> Result<(), BridgeError>;
    async fn delete_workload(&self, key: &WorkloadKey) -> Result<(), BridgeError>;
    async fn get_workload(&self, key: &WorkloadKey) -> Result<ManagedWorkload, BridgeError>;
    async fn get_status(&self, key: &WorkloadKey) -> Result<PodStatus, BridgeError>;
    async fn list_workloads(&self) -> Vec<ManagedWorkload>;
    async fn notify_workloads(&self, notifier: PodNotifier);
}

#[async_trait]
pub trait NodeProvider: Send + Sync {
    async fn ping(&self) -> Result<(), BridgeError>;
    async fn get_node(&self) -> NodeDescriptor;
    /// Registers the node callback and reports the current node once.
    async fn notify_node_status(&self, notifier: NodeNotifier);
}

#[derive(Clone)]
pub struct FleetBridge {
    state: SharedState,
}

impl FleetBridge {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub async fn set_workload_source(&self, source: DynWorkloadSource) {
        state::set_workload_source(&self.state, source).await;
    }

    pub async fn refresh_devices(&self) -> ReconcileOutcome {
        reconcile::refresh_registry_once(&self.state).await
    }

    pub async fn poll_statuses(&self) -> PollSummary {
        status_poll::poll_once(&self.state).await
    }

    pub async fn resync(&self) -> ResyncSummary {
        resync::resync_once(&self.state).await
    }

    pub async fn reconciliations(&self) -> Vec<ReconciliationRecord> {
        audit::records(&self.state).await
    }

    pub async fn disconnected_devices(&self) -> Vec<TrackerInfo> {
        disconnect::active_trackers(&self.state).await
    }
}

#[async_trait]
impl WorkloadLifecycle for FleetBridge {
    async fn create_workload(&self, workload: Workload) -> Result<(), BridgeError> {
        placement::create_workload(&self.state, workload)
            .await
            .map(|_| ())
    }

    async fn update_workload(&self, workload: Workload) -> Result<(), BridgeError> {
        replace::update_workload(&self.state, workload).await
    }

    async fn delete_workload(&self, key: &WorkloadKey) -> Result<(), BridgeError> {
        removal::delete_workload(&self.state, key).await
    }

    async fn get_workload(&self, key: &WorkloadKey) -> Result<ManagedWorkload, BridgeError> {
        state::mapping(&self.state, key)
            .await
            .map(|mapping| ManagedWorkload::from_mapping(&mapping))
            .ok_or_else(|| BridgeError::WorkloadNotFound {
                key: key.to_string(),
            })
    }

    async fn get_status(&self, key: &WorkloadKey) -> Result<PodStatus, BridgeError> {
        let managed = self.get_workload(key).await?;
        Ok(managed
            .status
            .unwrap_or_else(|| PodStatus::scheduled(&managed.device_id)))
    }

    async fn list_workloads(&self) -> Vec<ManagedWorkload> {
        state::all_mappings(&self.state)
            .await
            .iter()
            .map(ManagedWorkload::from_mapping)
            .collect()
    }

    async fn notify_workloads(&self, notifier: PodNotifier) {
        state::set_pod_notifier(&self.state, notifier).await;
    }
}

#[async_trait]
impl NodeProvider for FleetBridge {
    async fn ping(&self) -> Result<(), BridgeError> {
        let backend = self.state.backend();
        crate::backend::bounded("ping", self.state.cfg().request_timeout(), backend.ping())
            .await
            .map_err(BridgeError::from)
    }

    async fn get_node(&self) -> NodeDescriptor {
        node::get_node(&self.state).await
    }

    async fn notify_node_status(&self, notifier: NodeNotifier) {
        state::set_node_notifier(&self.state, notifier).await;
        node::maybe_notify_node(&self.state, true).await;
    }
}

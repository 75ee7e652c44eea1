use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    backend::DynFleetBackend,
    config,
    models::ResourceList,
    node::NodeDescriptor,
    provider::{DynWorkloadSource, NodeNotifier, PodEvent, PodNotifier},
    reconcile::{audit::AuditLog, disconnect::TrackerSet},
    registry::DeviceRegistry,
    selector::{DeviceLoad, LoadMap},
    telemetry,
    workload::{PodStatus, Workload, WorkloadKey},
};

/// Local record of "this workload runs on that device".
#[derive(Debug, Clone)]
pub struct PodDeviceMapping {
    pub key: WorkloadKey,
    pub uid: String,
    pub device_id: String,
    pub app_name: String,
    pub deployed_at: DateTime<Utc>,
    pub requested: ResourceList,
    /// Last status derived from the backend; `None` until known.
    pub status: Option<PodStatus>,
    pub workload: Workload,
}

impl PodDeviceMapping {
    pub fn new(workload: Workload, device_id: &str, status: Option<PodStatus>) -> Self {
        let key = workload.key();
        Self {
            app_name: key.app_name(),
            uid: workload.uid.clone(),
            device_id: device_id.to_string(),
            deployed_at: Utc::now(),
            requested: workload.requested_resources(),
            status,
            workload,
            key,
        }
    }
}

/// The mapping table. At most one entry per workload key.
#[derive(Debug, Default)]
pub struct MappingStore {
    entries: HashMap<WorkloadKey, PodDeviceMapping>,
}

impl MappingStore {
    pub fn get(&self, key: &WorkloadKey) -> Option<&PodDeviceMapping> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &WorkloadKey) -> Option<&mut PodDeviceMapping> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, mapping: PodDeviceMapping) -> Option<PodDeviceMapping> {
        let previous = self.entries.insert(mapping.key.clone(), mapping);
        telemetry::record_mapped_workloads(self.entries.len());
        previous
    }

    pub fn remove(&mut self, key: &WorkloadKey) -> Option<PodDeviceMapping> {
        let removed = self.entries.remove(key);
        telemetry::record_mapped_workloads(self.entries.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &PodDeviceMapping> {
        self.entries.values()
    }

    pub fn keys_on_device(&self, device_id: &str) -> Vec<WorkloadKey> {
        let mut keys: Vec<WorkloadKey> = self
            .entries
            .values()
            .filter(|mapping| mapping.device_id == device_id)
            .map(|mapping| mapping.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Committed load per device, optionally ignoring one workload.
    pub fn loads(&self, exclude: Option<&WorkloadKey>) -> LoadMap {
        let mut loads = LoadMap::new();
        for mapping in self.entries.values() {
            if exclude == Some(&mapping.key) {
                continue;
            }
            loads
                .entry(mapping.device_id.clone())
                .or_insert_with(DeviceLoad::default)
                .add(mapping.requested);
        }
        loads
    }
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    device_id: String,
    requested: ResourceList,
    cancelled: bool,
}

/// Placements between admission and mapping commit. Entries reserve capacity
/// on their device and can be cancelled by a concurrent delete.
#[derive(Debug, Default)]
pub struct PlacementTable {
    next_id: u64,
    in_flight: HashMap<WorkloadKey, InFlight>,
}

impl PlacementTable {
    pub fn reserve(&mut self, key: &WorkloadKey, device_id: &str, requested: ResourceList) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                device_id: device_id.to_string(),
                requested,
                cancelled: false,
            },
        );
        id
    }

    /// Marks the in-flight placement for `key` as cancelled. Returns whether
    /// one existed.
    pub fn cancel(&mut self, key: &WorkloadKey) -> bool {
        match self.in_flight.get_mut(key) {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, key: &WorkloadKey, id: u64) -> bool {
        self.in_flight
            .get(key)
            .is_none_or(|entry| entry.id != id || entry.cancelled)
    }

    pub fn release(&mut self, key: &WorkloadKey, id: u64) {
        if self.in_flight.get(key).is_some_and(|entry| entry.id == id) {
            self.in_flight.remove(key);
        }
    }

    pub fn contains(&self, key: &WorkloadKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn add_reservations(&self, loads: &mut LoadMap, exclude: Option<&WorkloadKey>) {
        for (key, entry) in &self.in_flight {
            if exclude == Some(key) || entry.cancelled {
                continue;
            }
            loads
                .entry(entry.device_id.clone())
                .or_insert_with(DeviceLoad::default)
                .add(entry.requested);
        }
    }
}

/// Releases an in-flight reservation when the placement future completes or
/// is dropped.
pub struct InFlightGuard {
    table: Arc<StdMutex<PlacementTable>>,
    key: WorkloadKey,
    id: u64,
}

impl InFlightGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.release(&self.key, self.id);
    }
}

pub struct AppState {
    pub poll_failures: HashMap<String, u32>,
    pub pod_notifier: Option<PodNotifier>,
    pub node_notifier: Option<NodeNotifier>,
    pub last_node_report: Option<NodeDescriptor>,
    pub workload_source: Option<DynWorkloadSource>,
    pub audit: AuditLog,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_resync: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SharedState {
    cfg: Arc<config::AppConfig>,
    app: Arc<Mutex<AppState>>,
    mappings: Arc<RwLock<MappingStore>>,
    placements: Arc<StdMutex<PlacementTable>>,
    trackers: Arc<Mutex<TrackerSet>>,
    /// Serializes read-modify-write of one device document.
    device_writes: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    registry: Arc<DeviceRegistry>,
    backend: DynFleetBackend,
}

impl SharedState {
    pub fn new(cfg: config::AppConfig, backend: DynFleetBackend) -> Self {
        let registry = Arc::new(DeviceRegistry::new(
            backend.clone(),
            cfg.registry_settings(),
        ));
        let app = Arc::new(Mutex::new(AppState {
            poll_failures: HashMap::new(),
            pod_notifier: None,
            node_notifier: None,
            last_node_report: None,
            workload_source: None,
            audit: AuditLog::default(),
            last_poll: None,
            last_resync: None,
        }));

        Self {
            cfg: Arc::new(cfg),
            app,
            mappings: Arc::new(RwLock::new(MappingStore::default())),
            placements: Arc::new(StdMutex::new(PlacementTable::default())),
            trackers: Arc::new(Mutex::new(TrackerSet::default())),
            device_writes: Arc::new(StdMutex::new(HashMap::new())),
            registry,
            backend,
        }
    }

    pub fn cfg(&self) -> &config::AppConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &DynFleetBackend {
        &self.backend
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, AppState> {
        self.app.lock().await
    }

    pub async fn mappings_read(&self) -> RwLockReadGuard<'_, MappingStore> {
        self.mappings.read().await
    }

    pub async fn mappings_write(&self) -> RwLockWriteGuard<'_, MappingStore> {
        self.mappings.write().await
    }

    pub async fn trackers(&self) -> tokio::sync::MutexGuard<'_, TrackerSet> {
        self.trackers.lock().await
    }

    pub fn placements(&self) -> StdMutexGuard<'_, PlacementTable> {
        self.placements.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-device lock held across a GET/PUT pair on the device document.
    pub fn device_write_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    pub fn guard_placement(&self, key: &WorkloadKey, id: u64) -> InFlightGuard {
        InFlightGuard {
            table: self.placements.clone(),
            key: key.clone(),
            id,
        }
    }
}

pub fn new_state(cfg: config::AppConfig, backend: DynFleetBackend) -> SharedState {
    SharedState::new(cfg, backend)
}

pub async fn mapping(state: &SharedState, key: &WorkloadKey) -> Option<PodDeviceMapping> {
    state.mappings_read().await.get(key).cloned()
}

pub async fn all_mappings(state: &SharedState) -> Vec<PodDeviceMapping> {
    let mut mappings: Vec<PodDeviceMapping> =
        state.mappings_read().await.values().cloned().collect();
    mappings.sort_by(|a, b| a.key.cmp(&b.key));
    mappings
}

/// Committed load per device including in-flight reservations.
pub async fn committed_loads(state: &SharedState, exclude: Option<&WorkloadKey>) -> LoadMap {
    let store = state.mappings_read().await;
    let mut loads = store.loads(exclude);
    state.placements().add_reservations(&mut loads, exclude);
    loads
}

/// Sends `event` to the registered pod notifier, if any.
pub async fn notify_pod(state: &SharedState, event: PodEvent) {
    let notifier = state.lock().await.pod_notifier.clone();
    if let Some(notifier) = notifier {
        notifier(event);
    }
}

pub async fn set_pod_notifier(state: &SharedState, notifier: PodNotifier) {
    state.lock().await.pod_notifier = Some(notifier);
}

pub async fn set_node_notifier(state: &SharedState, notifier: NodeNotifier) {
    state.lock().await.node_notifier = Some(notifier);
}

pub async fn set_workload_source(state: &SharedState, source: DynWorkloadSource) {
    state.lock().await.workload_source = Some(source);
}

pub async fn workload_source(state: &SharedState) -> Option<DynWorkloadSource> {
    state.lock().await.workload_source.clone()
}

/// Counts a failed poll for `device_id` and returns the consecutive total.
pub async fn record_poll_failure(state: &SharedState, device_id: &str) -> u32 {
    let mut guard = state.lock().await;
    let count = guard.poll_failures.entry(device_id.to_string()).or_insert(0);
    *count += 1;
    *count
}

pub async fn reset_poll_failures(state: &SharedState, device_id: &str) {
    state.lock().await.poll_failures.remove(device_id);
}

//! In-memory catalog of devices, fleets and per-device status snapshots.
//!
//! Backend calls are made without holding the catalog lock; results are
//! written back under a short write lock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::api::DeviceDocument;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DynFleetBackend, bounded};
use crate::error::{BridgeError, PlacementError};
use crate::models::{ConnectionState, Device, DeviceStatusSnapshot, Fleet, ResourceList};
use crate::telemetry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {device_id} not found")]
    NotFound { device_id: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<RegistryError> for BridgeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { device_id } => {
                BridgeError::Placement(PlacementError::DeviceNotFound { device_id })
            }
            RegistryError::Backend(err) => BridgeError::Backend(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub snapshot_ttl: Duration,
    pub grace_period: Duration,
    pub system_reserved: ResourceList,
    pub request_timeout: Duration,
}

/// A change of a device's connection state observed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTransition {
    pub device_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub listed: usize,
    pub transitions: Vec<ConnectionTransition>,
    pub removed: Vec<String>,
}

/// Result of refreshing one device document.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub device: Device,
    pub snapshot: DeviceStatusSnapshot,
    pub transition: Option<ConnectionTransition>,
}

#[derive(Debug)]
struct DeviceEntry {
    device: Device,
    last_listed: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceEntry>,
    fleets: HashMap<String, Fleet>,
    snapshots: HashMap<String, DeviceStatusSnapshot>,
    last_refresh: Option<DateTime<Utc>>,
}

impl RegistryInner {
    /// Stores `device`, returning the connection transition if any.
    fn upsert(&mut self, device: Device, now: Instant) -> Option<ConnectionTransition> {
        let previous = self
            .devices
            .get(&device.id)
            .map(|entry| entry.device.connection);
        let transition = match previous {
            Some(from) if from != device.connection => Some(ConnectionTransition {
                device_id: device.id.clone(),
                from,
                to: device.connection,
            }),
            _ => None,
        };
        self.devices.insert(
            device.id.clone(),
            DeviceEntry {
                device,
                last_listed: now,
            },
        );
        transition
    }
}

pub struct DeviceRegistry {
    backend: DynFleetBackend,
    settings: RegistrySettings,
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(backend: DynFleetBackend, settings: RegistrySettings) -> Self {
        Self {
            backend,
            settings,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Lists devices and fleets from the backend and folds them into the
    /// catalog. On failure the previous data stays in place and every known
    /// device drops to `Unknown` connection state.
    pub async fn refresh_devices(&self) -> Result<RefreshReport, BackendError> {
        let timeout = self.settings.request_timeout;
        let documents =
            match bounded("list_devices", timeout, self.backend.list_devices()).await {
                Ok(documents) => documents,
                Err(err) => {
                    let transitions = self.mark_all_unknown().await;
                    warn!(
                        error = %err,
                        devices = transitions.len(),
                        "device refresh failed; serving stale registry"
                    );
                    for transition in &transitions {
                        telemetry::record_device_transition(transition.to.as_str());
                    }
                    return Err(err);
                }
            };

        let fleets = match bounded("list_fleets", timeout, self.backend.list_fleets()).await {
            Ok(docs) => Some(
                docs.iter()
                    .map(Fleet::from_document)
                    .filter(|fleet| match fleet.validate() {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(fleet_id = %fleet.id, ?err, "skipping invalid fleet");
                            false
                        }
                    })
                    .collect::<Vec<_>>(),
            ),
            Err(err) => {
                warn!(error = %err, "fleet refresh failed; keeping previous fleets");
                None
            }
        };

        let now = Instant::now();
        let mut report = RefreshReport {
            listed: documents.len(),
            ..Default::default()
        };

        let mut inner = self.inner.write().await;
        let mut seen = Vec::with_capacity(documents.len());
        for doc in &documents {
            let device = Device::from_document(doc, self.settings.system_reserved);
            let snapshot = DeviceStatusSnapshot::from_document(doc, &device);
            seen.push(device.id.clone());
            inner.snapshots.insert(device.id.clone(), snapshot);
            if let Some(transition) = inner.upsert(device, now) {
                report.transitions.push(transition);
            }
        }

        let grace = self.settings.grace_period;
        let expired: Vec<String> = inner
            .devices
            .iter()
            .filter(|(id, entry)| {
                !seen.contains(id) && now.duration_since(entry.last_listed) >= grace
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.devices.remove(id);
            inner.snapshots.remove(id);
        }
        report.removed = expired;

        if let Some(fleets) = fleets {
            inner.fleets = fleets
                .into_iter()
                .map(|fleet| (fleet.id.clone(), fleet))
                .collect();
        }
        inner.last_refresh = Some(Utc::now());
        telemetry::set_registry_devices(inner.devices.len());
        drop(inner);

        for transition in &report.transitions {
            telemetry::record_device_transition(transition.to.as_str());
        }
        if !report.removed.is_empty() {
            info!(removed = ?report.removed, "forgot devices past the grace period");
        }
        debug!(
            listed = report.listed,
            transitions = report.transitions.len(),
            "device registry refreshed"
        );
        Ok(report)
    }

    async fn mark_all_unknown(&self) -> Vec<ConnectionTransition> {
        let mut inner = self.inner.write().await;
        let mut transitions = Vec::new();
        for entry in inner.devices.values_mut() {
            if entry.device.connection != ConnectionState::Unknown {
                transitions.push(ConnectionTransition {
                    device_id: entry.device.id.clone(),
                    from: entry.device.connection,
                    to: ConnectionState::Unknown,
                });
                entry.device.connection = ConnectionState::Unknown;
            }
        }
        for transition in &transitions {
            inner.snapshots.remove(&transition.device_id);
        }
        transitions
    }

    /// Devices matching an optional fleet and a label selector, ordered by id.
    pub async fn list_devices(
        &self,
        fleet: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .map(|entry| &entry.device)
            .filter(|device| fleet.map_or(true, |f| device.fleet_id.as_deref() == Some(f)))
            .filter(|device| device.matches_labels(labels))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.list_devices(None, &BTreeMap::new()).await
    }

    pub async fn cached_device(&self, device_id: &str) -> Option<Device> {
        let inner = self.inner.read().await;
        inner.devices.get(device_id).map(|entry| entry.device.clone())
    }

    /// Cached device, fetched from the backend once on a miss.
    pub async fn get_device(&self, device_id: &str) -> Result<Device, RegistryError> {
        if let Some(device) = self.cached_device(device_id).await {
            return Ok(device);
        }
        debug!(%device_id, "registry miss; fetching device on demand");
        Ok(self.refresh_snapshot(device_id).await?.device)
    }

    /// Cached snapshot if younger than the TTL, otherwise a synchronous
    /// refresh.
    pub async fn get_snapshot(
        &self,
        device_id: &str,
    ) -> Result<DeviceStatusSnapshot, RegistryError> {
        {
            let inner = self.inner.read().await;
            if let Some(snapshot) = inner
                .snapshots
                .get(device_id)
                .filter(|snapshot| !snapshot.is_stale(self.settings.snapshot_ttl))
            {
                return Ok(snapshot.clone());
            }
        }
        Ok(self.refresh_snapshot(device_id).await?.snapshot)
    }

    /// Fetches one device document and updates the device and its snapshot.
    pub async fn refresh_snapshot(&self, device_id: &str) -> Result<SnapshotUpdate, RegistryError> {
        let doc = self.fetch_document(device_id).await?;
        Ok(self.apply_document(&doc).await)
    }

    async fn fetch_document(&self, device_id: &str) -> Result<DeviceDocument, RegistryError> {
        match bounded(
            "get_device",
            self.settings.request_timeout,
            self.backend.get_device(device_id),
        )
        .await
        {
            Ok(doc) => Ok(doc),
            Err(err) if err.is_not_found() => Err(RegistryError::NotFound {
                device_id: device_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Folds a freshly fetched document into the catalog.
    pub async fn apply_document(&self, doc: &DeviceDocument) -> SnapshotUpdate {
        let device = Device::from_document(doc, self.settings.system_reserved);
        let snapshot = DeviceStatusSnapshot::from_document(doc, &device);

        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .insert(device.id.clone(), snapshot.clone());
        let transition = inner.upsert(device.clone(), Instant::now());
        telemetry::set_registry_devices(inner.devices.len());
        drop(inner);

        if let Some(transition) = &transition {
            telemetry::record_device_transition(transition.to.as_str());
        }
        SnapshotUpdate {
            device,
            snapshot,
            transition,
        }
    }

    /// Forces a device to `Disconnected` after sustained poll failures.
    pub async fn mark_disconnected(&self, device_id: &str) -> Option<ConnectionTransition> {
        let mut inner = self.inner.write().await;
        inner.snapshots.remove(device_id);
        let entry = inner.devices.get_mut(device_id)?;
        if entry.device.connection == ConnectionState::Disconnected {
            return None;
        }
        let transition = ConnectionTransition {
            device_id: device_id.to_string(),
            from: entry.device.connection,
            to: ConnectionState::Disconnected,
        };
        entry.device.connection = ConnectionState::Disconnected;
        drop(inner);

        telemetry::record_device_transition(transition.to.as_str());
        Some(transition)
    }

    /// Drops the cached snapshot so the next read goes to the backend.
    pub async fn invalidate_snapshot(&self, device_id: &str) {
        self.inner.write().await.snapshots.remove(device_id);
    }

    pub async fn list_fleets(&self) -> Vec<Fleet> {
        let inner = self.inner.read().await;
        let mut fleets: Vec<Fleet> = inner.fleets.values().cloned().collect();
        fleets.sort_by(|a, b| a.id.cmp(&b.id));
        fleets
    }

    pub async fn get_fleet(&self, fleet_id: &str) -> Option<Fleet> {
        self.inner.read().await.fleets.get(fleet_id).cloned()
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_refresh
    }
}

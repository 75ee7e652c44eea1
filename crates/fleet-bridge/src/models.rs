use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use common::api::{ApplicationStatus, DeviceDocument, FleetDocument, ResourceQuantities};
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use crate::quantity::{self, QuantityError};

/// CPU and memory amounts; CPU in millicores, memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceList {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl ResourceList {
    pub const ZERO: ResourceList = ResourceList {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn saturating_add(self, other: ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(self, other: ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// True when both dimensions are at most `available`.
    pub fn fits_within(&self, available: &ResourceList) -> bool {
        self.cpu_millis <= available.cpu_millis && self.memory_bytes <= available.memory_bytes
    }

    /// Component-wise minimum.
    pub fn clamp_to(self, ceiling: ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.min(ceiling.cpu_millis),
            memory_bytes: self.memory_bytes.min(ceiling.memory_bytes),
        }
    }

    pub fn from_quantities(raw: &ResourceQuantities) -> Result<ResourceList, QuantityError> {
        let cpu_millis = match raw.cpu.as_deref() {
            Some(cpu) => quantity::parse_cpu_millis(cpu)?,
            None => 0,
        };
        let memory_bytes = match raw.memory.as_deref() {
            Some(memory) => quantity::parse_memory_bytes(memory)?,
            None => 0,
        };
        Ok(ResourceList {
            cpu_millis,
            memory_bytes,
        })
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={}",
            quantity::format_cpu(self.cpu_millis),
            quantity::format_memory(self.memory_bytes)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DevicePhase {
    Ready,
    NotReady,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

impl DevicePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePhase::Ready => "Ready",
            DevicePhase::NotReady => "NotReady",
            DevicePhase::Unknown => "Unknown",
        }
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DevicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the backend's device summary string onto phase and connection state.
///
/// Devices the backend has lost contact with report `Unknown`, which is the
/// signal that drives the disconnection timeout.
pub fn classify_summary(summary: Option<&str>) -> (DevicePhase, ConnectionState) {
    let Some(raw) = summary else {
        return (DevicePhase::Unknown, ConnectionState::Unknown);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "online" | "degraded" => (DevicePhase::Ready, ConnectionState::Connected),
        "error" | "rebooting" => (DevicePhase::NotReady, ConnectionState::Connected),
        "poweredoff" | "offline" | "unknown" => {
            (DevicePhase::NotReady, ConnectionState::Disconnected)
        }
        _ => (DevicePhase::Unknown, ConnectionState::Unknown),
    }
}

/// A remotely managed device as seen through the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub fleet_id: Option<String>,
    pub labels: HashMap<String, String>,
    pub capacity: ResourceList,
    /// Capacity minus system reservation; never above `capacity`.
    pub allocatable: ResourceList,
    pub phase: DevicePhase,
    pub connection: ConnectionState,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Device {
    /// Builds a device from a backend document. `default_reserved` applies when
    /// the device does not report its own reservation.
    pub fn from_document(doc: &DeviceDocument, default_reserved: ResourceList) -> Device {
        let id = doc.metadata.name.clone();
        let status = doc.status.as_ref();
        let (phase, connection) =
            classify_summary(status.and_then(|s| s.summary.as_ref()).map(|s| s.status.as_str()));

        let capacity = status
            .and_then(|s| s.capacity.as_ref())
            .map(|raw| {
                ResourceList::from_quantities(raw).unwrap_or_else(|err| {
                    warn!(device_id = %id, ?err, "ignoring unparsable device capacity");
                    ResourceList::ZERO
                })
            })
            .unwrap_or_default();
        let reserved = status
            .and_then(|s| s.reserved.as_ref())
            .and_then(|raw| match ResourceList::from_quantities(raw) {
                Ok(list) => Some(list),
                Err(err) => {
                    warn!(device_id = %id, ?err, "ignoring unparsable device reservation");
                    None
                }
            })
            .unwrap_or(default_reserved);

        let name = doc
            .metadata
            .labels
            .get("alias")
            .cloned()
            .unwrap_or_else(|| id.clone());

        Device {
            fleet_id: doc.fleet_id().map(str::to_string),
            labels: doc.metadata.labels.clone(),
            allocatable: capacity.saturating_sub(reserved).clamp_to(capacity),
            capacity,
            phase,
            connection,
            last_heartbeat: status.and_then(|s| s.last_seen),
            name,
            id,
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.phase == DevicePhase::Ready && self.connection == ConnectionState::Connected
    }

    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Named device grouping mirrored from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fleet {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub device_count: i64,
}

impl Fleet {
    pub fn from_document(doc: &FleetDocument) -> Fleet {
        Fleet {
            id: doc.metadata.name.clone(),
            name: doc
                .metadata
                .labels
                .get("name")
                .cloned()
                .unwrap_or_else(|| doc.metadata.name.clone()),
            labels: doc.metadata.labels.clone(),
            device_count: doc
                .status
                .as_ref()
                .and_then(|s| s.devices_summary.as_ref())
                .map(|summary| summary.total)
                .unwrap_or(0),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("fleet id cannot be empty");
        }
        if self.name.trim().is_empty() {
            anyhow::bail!("fleet {} has an empty name", self.id);
        }
        if self.device_count < 0 {
            anyhow::bail!(
                "fleet {} reports a negative device count ({})",
                self.id,
                self.device_count
            );
        }
        Ok(())
    }
}

/// Cached runtime view of one device, refreshed from its backend document.
#[derive(Debug, Clone)]
pub struct DeviceStatusSnapshot {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub fetched_at: Instant,
    pub phase: DevicePhase,
    pub connection: ConnectionState,
    pub allocatable: ResourceList,
    /// Application names declared in the device spec.
    pub declared: BTreeSet<String>,
    /// Runtime status entries keyed by application name.
    pub reported: HashMap<String, ApplicationStatus>,
}

impl DeviceStatusSnapshot {
    pub fn from_document(doc: &DeviceDocument, device: &Device) -> DeviceStatusSnapshot {
        DeviceStatusSnapshot {
            device_id: device.id.clone(),
            observed_at: Utc::now(),
            fetched_at: Instant::now(),
            phase: device.phase,
            connection: device.connection,
            allocatable: device.allocatable,
            declared: doc
                .spec
                .applications
                .iter()
                .map(|app| app.name.clone())
                .collect(),
            reported: doc
                .status
                .as_ref()
                .map(|status| {
                    status
                        .applications
                        .iter()
                        .map(|app| (app.name.clone(), app.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn is_stale(&self, ttl: std::time::Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::api::{
        Application, DeviceStatus, DevicesSummary, FleetStatus, ObjectMeta, StatusSummary,
    };

    fn doc(summary: Option<&str>, cpu: &str, memory: &str) -> DeviceDocument {
        DeviceDocument {
            metadata: ObjectMeta {
                name: "dev-1".into(),
                labels: HashMap::from([("site".to_string(), "north".to_string())]),
                owner: Some("Fleet/edge".into()),
                ..Default::default()
            },
            status: Some(DeviceStatus {
                summary: summary.map(|s| StatusSummary {
                    status: s.into(),
                    info: None,
                }),
                capacity: Some(ResourceQuantities {
                    cpu: Some(cpu.into()),
                    memory: Some(memory.into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn device_from_document_subtracts_reservation() {
        let device = Device::from_document(
            &doc(Some("Online"), "4", "8Gi"),
            ResourceList::new(500, 1 << 30),
        );
        assert_eq!(device.fleet_id.as_deref(), Some("edge"));
        assert_eq!(device.capacity, ResourceList::new(4_000, 8 << 30));
        assert_eq!(device.allocatable, ResourceList::new(3_500, 7 << 30));
        assert!(device.is_schedulable());
    }

    #[test]
    fn allocatable_never_exceeds_capacity() {
        let device = Device::from_document(
            &doc(Some("Online"), "1", "1Gi"),
            ResourceList::new(4_000, 4 << 30),
        );
        assert_eq!(device.allocatable, ResourceList::ZERO);
        assert!(device.allocatable.fits_within(&device.capacity));
    }

    #[test]
    fn unparsable_capacity_is_treated_as_zero() {
        let device = Device::from_document(&doc(Some("Online"), "lots", "8Gi"), ResourceList::ZERO);
        assert_eq!(device.capacity, ResourceList::ZERO);
    }

    #[test]
    fn summary_classification() {
        assert_eq!(
            classify_summary(Some("online")),
            (DevicePhase::Ready, ConnectionState::Connected)
        );
        assert_eq!(
            classify_summary(Some("Error")),
            (DevicePhase::NotReady, ConnectionState::Connected)
        );
        assert_eq!(
            classify_summary(Some("Unknown")),
            (DevicePhase::NotReady, ConnectionState::Disconnected)
        );
        assert_eq!(
            classify_summary(None),
            (DevicePhase::Unknown, ConnectionState::Unknown)
        );
    }

    #[test]
    fn label_selector_requires_every_pair() {
        let device = Device::from_document(&doc(Some("Online"), "1", "1Gi"), ResourceList::ZERO);
        let mut selector = BTreeMap::new();
        assert!(device.matches_labels(&selector));
        selector.insert("site".to_string(), "north".to_string());
        assert!(device.matches_labels(&selector));
        selector.insert("tier".to_string(), "gpu".to_string());
        assert!(!device.matches_labels(&selector));
    }

    #[test]
    fn fleet_validation_rejects_negative_counts() {
        let mut fleet = Fleet::from_document(&FleetDocument {
            metadata: ObjectMeta {
                name: "edge".into(),
                ..Default::default()
            },
            status: Some(FleetStatus {
                devices_summary: Some(DevicesSummary { total: 3 }),
            }),
        });
        assert_eq!(fleet.device_count, 3);
        fleet.validate().expect("valid fleet");

        fleet.device_count = -1;
        assert!(fleet.validate().is_err());
    }

    #[test]
    fn snapshot_collects_declared_and_reported_apps() {
        let mut document = doc(Some("Online"), "2", "2Gi");
        document.spec.applications.push(Application {
            name: "default-web".into(),
            app_type: "compose".into(),
            inline: Vec::new(),
        });
        if let Some(status) = document.status.as_mut() {
            status.applications.push(ApplicationStatus {
                name: "default-web".into(),
                status: "Running".into(),
                summary: None,
            });
        }
        let device = Device::from_document(&document, ResourceList::ZERO);
        let snapshot = DeviceStatusSnapshot::from_document(&document, &device);
        assert!(snapshot.declared.contains("default-web"));
        assert_eq!(snapshot.reported["default-web"].status, "Running");
        assert!(!snapshot.is_stale(std::time::Duration::from_secs(30)));
    }
}

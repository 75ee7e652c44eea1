//! Orchestrator-side workload and status shapes consumed by the bridge.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlacementError;
use crate::models::ResourceList;

/// Annotation naming the exact device a workload must run on.
pub const DEVICE_ANNOTATION: &str = "fleet-bridge.io/device-id";
/// Annotation naming a fleet; fleet-based selection is rejected.
pub const FLEET_ANNOTATION: &str = "fleet-bridge.io/fleet-id";
/// Annotation carrying a `key=value,key2=value2` device label selector.
pub const SELECTOR_ANNOTATION: &str = "fleet-bridge.io/device-selector";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the backend application entry carrying this workload.
    pub fn app_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// Source of an environment variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvValue {
    Literal(String),
    SecretKeyRef { name: String, key: String },
    ConfigMapKeyRef { name: String, key: String },
    FieldRef { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub requests: ResourceRequests,
}

/// Per-container resource requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
}

/// A workload object handed over by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

impl Workload {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Requests summed across all containers.
    pub fn requested_resources(&self) -> ResourceList {
        self.containers
            .iter()
            .fold(ResourceList::ZERO, |acc, container| {
                acc.saturating_add(ResourceList::new(
                    container.requests.cpu_millis,
                    container.requests.memory_bytes,
                ))
            })
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Extracts placement criteria from annotations.
    ///
    /// An explicit device wins over everything else. A fleet annotation fails
    /// loudly. Workloads without annotations fall back to `default_device`.
    pub fn placement_request(
        &self,
        default_device: Option<&str>,
    ) -> Result<PlacementRequest, PlacementError> {
        if let Some(device_id) = self.annotation(DEVICE_ANNOTATION) {
            return Ok(PlacementRequest::device(device_id));
        }

        if let Some(fleet_id) = self.annotation(FLEET_ANNOTATION) {
            return Err(PlacementError::FleetSelectionUnsupported {
                fleet_id: fleet_id.to_string(),
            });
        }

        if let Some(raw) = self.annotation(SELECTOR_ANNOTATION) {
            let selector = parse_selector(raw)?;
            return Ok(PlacementRequest {
                device_id: None,
                fleet_id: None,
                selector,
            });
        }

        match default_device.map(str::trim).filter(|id| !id.is_empty()) {
            Some(device_id) => Ok(PlacementRequest::device(device_id)),
            None => Err(PlacementError::PlacementUnspecified {
                workload: self.key().to_string(),
            }),
        }
    }
}

/// Criteria used to pick a device for one workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlacementRequest {
    pub device_id: Option<String>,
    pub fleet_id: Option<String>,
    pub selector: BTreeMap<String, String>,
}

impl PlacementRequest {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    /// Human readable criteria for diagnostics.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(device) = &self.device_id {
            parts.push(format!("device={device}"));
        }
        if let Some(fleet) = &self.fleet_id {
            parts.push(format!("fleet={fleet}"));
        }
        if !self.selector.is_empty() {
            let labels: Vec<String> = self
                .selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            parts.push(format!("labels[{}]", labels.join(",")));
        }
        if parts.is_empty() {
            "any device".to_string()
        } else {
            parts.join(" ")
        }
    }
}

fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>, PlacementError> {
    let mut selector = BTreeMap::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(PlacementError::InvalidSelector {
                raw: raw.to_string(),
                reason: format!("entry {trimmed:?} is not key=value"),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(PlacementError::InvalidSelector {
                raw: raw.to_string(),
                reason: "empty label key".to_string(),
            });
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    if selector.is_empty() {
        return Err(PlacementError::InvalidSelector {
            raw: raw.to_string(),
            reason: "selector has no entries".to_string(),
        });
    }
    Ok(selector)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    PodScheduled,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    pub kind: ConditionKind,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl PodCondition {
    pub fn new(
        kind: ConditionKind,
        status: ConditionStatus,
        reason: &str,
        message: Option<String>,
    ) -> Self {
        Self {
            kind,
            status,
            reason: reason.to_string(),
            message,
            last_transition: Utc::now(),
        }
    }
}

/// Status reported back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub conditions: Vec<PodCondition>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl PodStatus {
    /// Status recorded right after a successful placement.
    pub fn scheduled(device_id: &str) -> Self {
        Self {
            phase: PodPhase::Pending,
            conditions: vec![PodCondition::new(
                ConditionKind::PodScheduled,
                ConditionStatus::True,
                "Scheduled",
                Some(format!("scheduled to device {device_id}")),
            )],
            reason: None,
            message: None,
        }
    }

    /// Status forced onto workloads of a device that stopped reporting.
    pub fn device_disconnected(device_id: &str) -> Self {
        Self {
            phase: PodPhase::Unknown,
            conditions: vec![PodCondition::new(
                ConditionKind::Ready,
                ConditionStatus::Unknown,
                "DeviceDisconnected",
                Some(format!("device {device_id} is not reporting")),
            )],
            reason: Some("DeviceDisconnected".to_string()),
            message: Some(format!("device {device_id} is not reporting")),
        }
    }

    /// Terminal status for workloads evicted after the reconnection deadline.
    pub fn device_unreachable(device_id: &str, after: std::time::Duration) -> Self {
        let message = format!(
            "device {device_id} unreachable for {}s; workload removed",
            after.as_secs()
        );
        Self {
            phase: PodPhase::Failed,
            conditions: vec![PodCondition::new(
                ConditionKind::Ready,
                ConditionStatus::False,
                "DeviceUnreachable",
                Some(message.clone()),
            )],
            reason: Some("DeviceUnreachable".to_string()),
            message: Some(message),
        }
    }

    pub fn ready(&self) -> Option<ConditionStatus> {
        self.conditions
            .iter()
            .find(|c| c.kind == ConditionKind::Ready)
            .map(|c| c.status)
    }

    /// Compares everything except transition timestamps.
    pub fn same_state(&self, other: &PodStatus) -> bool {
        self.phase == other.phase
            && self.reason == other.reason
            && self.message == other.message
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(&other.conditions)
                .all(|(a, b)| {
                    a.kind == b.kind
                        && a.status == b.status
                        && a.reason == b.reason
                        && a.message == b.message
                })
    }
}

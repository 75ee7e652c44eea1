//! Documents exchanged with the fleet-management backend.
//!
//! Fields the bridge does not interpret are preserved through `extra` maps so a
//! full-document `PUT` never drops data written by other backend clients.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application type used for compose payloads.
pub const APP_TYPE_COMPOSE: &str = "compose";

/// Path of the inline compose file inside an application entry.
pub const COMPOSE_INLINE_PATH: &str = "podman-compose.yaml";

/// Owner prefix used by the backend to link devices to fleets.
pub const FLEET_OWNER_PREFIX: &str = "Fleet/";

/// Complete device resource as returned by `GET /api/v1/devices/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDocument {
    /// API version string, echoed back on update.
    #[serde(default)]
    pub api_version: String,
    /// Resource kind (`Device`).
    #[serde(default)]
    pub kind: String,
    /// Identity and labels.
    pub metadata: ObjectMeta,
    /// Desired configuration; the application list is the only part we mutate.
    #[serde(default)]
    pub spec: DeviceSpec,
    /// Runtime status reported by the device agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
}

impl DeviceDocument {
    /// Fleet id derived from the `Fleet/<id>` owner reference.
    pub fn fleet_id(&self) -> Option<&str> {
        self.metadata
            .owner
            .as_deref()
            .and_then(|owner| owner.strip_prefix(FLEET_OWNER_PREFIX))
            .filter(|id| !id.is_empty())
    }

    /// Returns the application entry named `name`, if declared.
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.spec.applications.iter().find(|app| app.name == name)
    }

    /// Returns the runtime status entry named `name`, if reported.
    pub fn application_status(&self, name: &str) -> Option<&ApplicationStatus> {
        self.status
            .as_ref()
            .and_then(|status| status.applications.iter().find(|app| app.name == name))
    }
}

/// Resource metadata shared by devices and fleets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name; used as the id.
    pub name: String,
    /// Label set.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Owner reference (`Fleet/<id>` for fleet-managed devices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Unmodelled metadata preserved across updates.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Device spec; `applications` is owned by the bridge, the rest is passthrough.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Declared applications.
    #[serde(default)]
    pub applications: Vec<Application>,
    /// Unmodelled spec sections (systemd, os, config...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One application declared on a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Unique name within the device.
    pub name: String,
    /// Application type, e.g. `compose`.
    #[serde(default)]
    pub app_type: String,
    /// Inline file content.
    #[serde(default)]
    pub inline: Vec<InlineContent>,
}

/// Inline file embedded in an application entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InlineContent {
    /// Path of the file on the device.
    pub path: String,
    /// File body.
    pub content: String,
}

/// Runtime status sub-document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Per-application runtime state.
    #[serde(default)]
    pub applications: Vec<ApplicationStatus>,
    /// Device conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Overall device summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<StatusSummary>,
    /// Last time the device agent checked in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Capacity reported by the device, as quantity strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<ResourceQuantities>,
    /// Resources reserved for the system on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<ResourceQuantities>,
}

/// Runtime state of one application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplicationStatus {
    /// Application name.
    pub name: String,
    /// Raw status string (`running`, `pending`, ...).
    #[serde(default)]
    pub status: String,
    /// Human readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Device condition entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Condition type.
    #[serde(rename = "type")]
    pub kind: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall device status summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSummary {
    /// `Online`, `Degraded`, `Error`, `Rebooting`, `PoweredOff`, `Unknown`.
    pub status: String,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// CPU and memory quantities in orchestrator notation (`500m`, `8Gi`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceQuantities {
    /// CPU quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// `GET /api/v1/devices` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceList {
    /// Devices.
    #[serde(default)]
    pub items: Vec<DeviceDocument>,
}

/// Fleet resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetDocument {
    /// Identity and labels.
    pub metadata: ObjectMeta,
    /// Aggregated fleet status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FleetStatus>,
}

/// Fleet status sub-document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// Device counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices_summary: Option<DevicesSummary>,
}

/// Device counts within a fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DevicesSummary {
    /// Total devices owned by the fleet.
    #[serde(default)]
    pub total: i64,
}

/// `GET /api/v1/fleets` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetList {
    /// Fleets.
    #[serde(default)]
    pub items: Vec<FleetDocument>,
}

/// OAuth2 token endpoint response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    /// Bearer token.
    #[serde(default)]
    pub access_token: String,
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_document_preserves_unknown_fields() {
        let raw = json!({
            "apiVersion": "v1alpha1",
            "kind": "Device",
            "metadata": {
                "name": "dev-1",
                "owner": "Fleet/edge",
                "resourceVersion": "42"
            },
            "spec": {
                "systemd": { "matchPatterns": ["podman.service"] },
                "applications": []
            }
        });

        let doc: DeviceDocument = serde_json::from_value(raw).expect("decode");
        assert_eq!(doc.fleet_id(), Some("edge"));
        assert!(doc.spec.extra.contains_key("systemd"));

        let encoded = serde_json::to_value(&doc).expect("encode");
        assert_eq!(encoded["metadata"]["resourceVersion"], "42");
        assert_eq!(
            encoded["spec"]["systemd"]["matchPatterns"][0],
            "podman.service"
        );
        assert!(encoded.get("status").is_none());
    }

    #[test]
    fn fleet_id_requires_fleet_owner() {
        let mut doc = DeviceDocument::default();
        assert_eq!(doc.fleet_id(), None);
        doc.metadata.owner = Some("Other/thing".into());
        assert_eq!(doc.fleet_id(), None);
        doc.metadata.owner = Some("Fleet/".into());
        assert_eq!(doc.fleet_id(), None);
    }

    #[test]
    fn application_lookups_find_spec_and_status() {
        let doc: DeviceDocument = serde_json::from_value(json!({
            "metadata": { "name": "dev-1" },
            "spec": { "applications": [{ "name": "ns-web", "appType": "compose", "inline": [] }] },
            "status": { "applications": [{ "name": "ns-web", "status": "Running" }] }
        }))
        .expect("decode");

        assert!(doc.application("ns-web").is_some());
        assert!(doc.application("ns-db").is_none());
        assert_eq!(
            doc.application_status("ns-web").map(|s| s.status.as_str()),
            Some("Running")
        );
    }
}

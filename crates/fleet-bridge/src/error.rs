use thiserror::Error;

use crate::backend::BackendError;
use crate::models::{ConnectionState, DevicePhase, ResourceList};

/// Why a workload could not be placed. Terminal for the attempt; the
/// orchestrator drives retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("device {device_id} not found in the fleet backend")]
    DeviceNotFound { device_id: String },
    #[error("device {device_id} is not eligible: phase {phase}, connection {connection}")]
    DeviceNotReady {
        device_id: String,
        phase: DevicePhase,
        connection: ConnectionState,
    },
    #[error("no suitable device for {criteria}: {considered} device(s) considered, {reason}")]
    NoSuitableDevice {
        criteria: String,
        considered: usize,
        reason: String,
    },
    #[error(
        "insufficient resources on device {device_id}: requested {requested}, available {available}"
    )]
    InsufficientResources {
        device_id: String,
        requested: ResourceList,
        available: ResourceList,
    },
    #[error(
        "fleet-based device selection is not implemented (fleet {fleet_id}); annotate the workload with fleet-bridge.io/device-id"
    )]
    FleetSelectionUnsupported { fleet_id: String },
    #[error(
        "workload {workload} has no placement annotation and no default device is configured"
    )]
    PlacementUnspecified { workload: String },
    #[error("invalid device selector {raw:?}: {reason}")]
    InvalidSelector { raw: String, reason: String },
}

/// Coarse error classes surfaced to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceNotFound,
    DeviceNotReady,
    NoSuitableDevice,
    InsufficientResources,
    FleetSelectionUnsupported,
    PlacementUnspecified,
    InvalidSelector,
    BackendUnreachable,
    BackendRejected,
    WorkloadNotFound,
    Translation,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::DeviceNotReady => "device_not_ready",
            ErrorKind::NoSuitableDevice => "no_suitable_device",
            ErrorKind::InsufficientResources => "insufficient_resources",
            ErrorKind::FleetSelectionUnsupported => "fleet_selection_unsupported",
            ErrorKind::PlacementUnspecified => "placement_unspecified",
            ErrorKind::InvalidSelector => "invalid_selector",
            ErrorKind::BackendUnreachable => "backend_unreachable",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::WorkloadNotFound => "workload_not_found",
            ErrorKind::Translation => "translation",
        }
    }
}

impl PlacementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlacementError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            PlacementError::DeviceNotReady { .. } => ErrorKind::DeviceNotReady,
            PlacementError::NoSuitableDevice { .. } => ErrorKind::NoSuitableDevice,
            PlacementError::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            PlacementError::FleetSelectionUnsupported { .. } => {
                ErrorKind::FleetSelectionUnsupported
            }
            PlacementError::PlacementUnspecified { .. } => ErrorKind::PlacementUnspecified,
            PlacementError::InvalidSelector { .. } => ErrorKind::InvalidSelector,
        }
    }
}

/// Error returned by the orchestrator-facing operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("workload {key} is not managed by this bridge")]
    WorkloadNotFound { key: String },
    #[error("failed to render application for {key}: {source}")]
    Translation {
        key: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Placement(err) => err.kind(),
            BridgeError::Backend(err) if err.is_rejection() => ErrorKind::BackendRejected,
            BridgeError::Backend(_) => ErrorKind::BackendUnreachable,
            BridgeError::WorkloadNotFound { .. } => ErrorKind::WorkloadNotFound,
            BridgeError::Translation { .. } => ErrorKind::Translation,
        }
    }

    /// Transport failures may clear up; placement and rejection errors need a
    /// change on the caller's side first.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::BackendUnreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::DEVICE_ANNOTATION;

    #[test]
    fn insufficient_resources_message_names_both_dimensions() {
        let err = PlacementError::InsufficientResources {
            device_id: "dev-1".into(),
            requested: ResourceList::new(100_000, 1 << 30),
            available: ResourceList::new(4_000, 8 << 30),
        };
        let message = err.to_string();
        assert!(message.contains("dev-1"), "{message}");
        assert!(message.contains("requested cpu=100 memory=1Gi"), "{message}");
        assert!(message.contains("available cpu=4 memory=8Gi"), "{message}");
    }

    #[test]
    fn fleet_error_points_at_device_annotation() {
        let err = PlacementError::FleetSelectionUnsupported {
            fleet_id: "edge".into(),
        };
        assert!(err.to_string().contains(DEVICE_ANNOTATION));
    }

    #[test]
    fn kinds_and_retryability() {
        let placement: BridgeError = PlacementError::DeviceNotFound {
            device_id: "dev-9".into(),
        }
        .into();
        assert_eq!(placement.kind(), ErrorKind::DeviceNotFound);
        assert!(!placement.is_retryable());

        let unreachable: BridgeError = BackendError::Unreachable {
            operation: "get_device".into(),
            source: anyhow::anyhow!("connection refused"),
        }
        .into();
        assert_eq!(unreachable.kind(), ErrorKind::BackendUnreachable);
        assert!(unreachable.is_retryable());

        let rejected: BridgeError = BackendError::Rejected {
            operation: "update_device".into(),
            status: reqwest::StatusCode::CONFLICT,
            body: "conflict".into(),
        }
        .into();
        assert_eq!(rejected.kind(), ErrorKind::BackendRejected);
        assert_eq!(rejected.kind().label(), "backend_rejected");
    }
}

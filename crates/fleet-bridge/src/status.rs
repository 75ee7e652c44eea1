//! Inbound status mapping from backend application state to pod status.

use common::api::ApplicationStatus;

use crate::models::DeviceStatusSnapshot;
use crate::workload::{ConditionKind, ConditionStatus, PodCondition, PodPhase, PodStatus};

/// Application status vocabulary reported by the backend, parsed once at
/// ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStatus {
    Running,
    Pending,
    Starting,
    Failed,
    Error,
    Completed,
    Succeeded,
    Stopped,
    Unrecognized(String),
}

impl AppStatus {
    pub fn parse(raw: &str) -> AppStatus {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => AppStatus::Running,
            "pending" => AppStatus::Pending,
            "starting" => AppStatus::Starting,
            "failed" => AppStatus::Failed,
            "error" => AppStatus::Error,
            "completed" => AppStatus::Completed,
            "succeeded" => AppStatus::Succeeded,
            "stopped" => AppStatus::Stopped,
            _ => AppStatus::Unrecognized(raw.to_string()),
        }
    }

    pub fn phase(&self) -> PodPhase {
        match self {
            AppStatus::Running => PodPhase::Running,
            AppStatus::Pending | AppStatus::Starting => PodPhase::Pending,
            AppStatus::Failed | AppStatus::Error => PodPhase::Failed,
            AppStatus::Completed | AppStatus::Succeeded | AppStatus::Stopped => {
                PodPhase::Succeeded
            }
            AppStatus::Unrecognized(_) => PodPhase::Pending,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AppStatus::Running => "ApplicationRunning",
            AppStatus::Pending | AppStatus::Starting => "ApplicationStarting",
            AppStatus::Failed | AppStatus::Error => "ApplicationFailed",
            AppStatus::Completed | AppStatus::Succeeded => "ApplicationCompleted",
            AppStatus::Stopped => "ApplicationStopped",
            AppStatus::Unrecognized(_) => "UnknownStatus",
        }
    }

    /// `None` for phases that carry no Ready condition.
    fn ready(&self) -> Option<ConditionStatus> {
        match self.phase() {
            PodPhase::Running => Some(ConditionStatus::True),
            PodPhase::Failed | PodPhase::Succeeded => Some(ConditionStatus::False),
            PodPhase::Pending | PodPhase::Unknown => None,
        }
    }
}

/// Maps one reported application entry to a pod status.
pub fn map_app_status(app: &ApplicationStatus) -> PodStatus {
    let status = AppStatus::parse(&app.status);
    let reason = status.reason();
    let message = match (&status, app.summary.as_deref()) {
        (_, Some(summary)) if !summary.trim().is_empty() => Some(summary.to_string()),
        (AppStatus::Unrecognized(raw), _) if raw.trim().is_empty() => {
            Some("backend reported no application status".to_string())
        }
        (AppStatus::Unrecognized(raw), _) => {
            Some(format!("unrecognized application status {raw:?}"))
        }
        _ => None,
    };

    let mut conditions = vec![PodCondition::new(
        ConditionKind::PodScheduled,
        ConditionStatus::True,
        "Scheduled",
        None,
    )];
    if let Some(ready) = status.ready() {
        conditions.push(PodCondition::new(
            ConditionKind::Ready,
            ready,
            reason,
            message.clone(),
        ));
    }

    PodStatus {
        phase: status.phase(),
        conditions,
        reason: Some(reason.to_string()),
        message,
    }
}

/// Application declared on the device with no runtime entry yet.
pub fn awaiting_runtime_report(device_id: &str) -> PodStatus {
    let message = format!("deployed to device {device_id}, awaiting runtime report");
    PodStatus {
        phase: PodPhase::Pending,
        conditions: vec![PodCondition::new(
            ConditionKind::PodScheduled,
            ConditionStatus::True,
            "ApplicationDeployed",
            Some(message.clone()),
        )],
        reason: Some("ApplicationDeployed".to_string()),
        message: Some(message),
    }
}

/// Derives the status of `app_name` from a device snapshot. Returns `None`
/// when the application is neither declared nor reported on the device.
pub fn derive_status(snapshot: &DeviceStatusSnapshot, app_name: &str) -> Option<PodStatus> {
    if let Some(reported) = snapshot.reported.get(app_name) {
        return Some(map_app_status(reported));
    }
    if snapshot.declared.contains(app_name) {
        return Some(awaiting_runtime_report(&snapshot.device_id));
    }
    None
}

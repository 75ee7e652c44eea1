//! Periodic status synchronization for mapped workloads.
//!
//! Devices are polled concurrently, one backend read per device per pass.
//! Only statuses that actually changed are written back and announced.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    models::ConnectionState,
    node,
    provider::{ManagedWorkload, PodEvent},
    reconcile::{
        ReconcileOutcome,
        audit::{self, Action, Operation, ReconciliationRecord},
        disconnect::{self, ConnectionChange},
        millis,
    },
    registry::RegistryError,
    state::{self, SharedState},
    status, telemetry,
    workload::{PodPhase, PodStatus, WorkloadKey},
};

/// Result of polling one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevicePoll {
    pub updated: usize,
    pub failed: bool,
    /// The device's connection state changed during this poll.
    pub transitioned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub devices: usize,
    pub updated: usize,
    pub failed: usize,
}

impl PollSummary {
    fn outcome(&self) -> ReconcileOutcome {
        if self.failed == 0 {
            ReconcileOutcome::Applied
        } else if self.failed < self.devices {
            ReconcileOutcome::Partial
        } else {
            ReconcileOutcome::BackendUnavailable
        }
    }
}

/// One polling pass over every device that has mapped workloads.
pub async fn poll_once(state: &SharedState) -> PollSummary {
    let started = Instant::now();
    let devices: BTreeSet<String> = state
        .mappings_read()
        .await
        .values()
        .map(|mapping| mapping.device_id.clone())
        .collect();

    let mut summary = PollSummary {
        devices: devices.len(),
        ..Default::default()
    };
    let mut transitioned = false;
    let mut polls = JoinSet::new();
    for device_id in devices {
        let state = state.clone();
        polls.spawn(async move { poll_device(&state, &device_id).await });
    }
    while let Some(joined) = polls.join_next().await {
        match joined {
            Ok(poll) => {
                summary.updated += poll.updated;
                summary.failed += usize::from(poll.failed);
                transitioned |= poll.transitioned;
            }
            Err(err) => {
                warn!(?err, "device poll task failed");
                summary.failed += 1;
            }
        }
    }

    state.lock().await.last_poll = Some(Utc::now());
    if summary.devices > 0 {
        telemetry::record_status_poll(summary.outcome().label());
    }
    debug!(
        devices = summary.devices,
        updated = summary.updated,
        failed = summary.failed,
        elapsed_ms = millis(started.elapsed()),
        "status poll complete"
    );
    node::maybe_notify_node(state, transitioned).await;
    summary
}

/// Refreshes one device and re-derives the status of each workload mapped to
/// it. Also used for the immediate poll after a device reconnects.
pub async fn poll_device(state: &SharedState, device_id: &str) -> DevicePoll {
    if state.mappings_read().await.keys_on_device(device_id).is_empty() {
        return DevicePoll::default();
    }

    let update = match state.registry().refresh_snapshot(device_id).await {
        Ok(update) => update,
        Err(RegistryError::NotFound { .. }) => {
            // Deleted at the backend; the registry grace period and the timer
            // path own what happens next.
            warn!(%device_id, "mapped device no longer exists at the backend");
            return poll_failed(state, device_id).await;
        }
        Err(err) => {
            debug!(%device_id, ?err, "device poll failed");
            return poll_failed(state, device_id).await;
        }
    };
    state::reset_poll_failures(state, device_id).await;

    let mut poll = DevicePoll {
        transitioned: update.transition.is_some(),
        ..Default::default()
    };
    let change = disconnect::observe_connection(state, device_id, update.device.connection).await;
    if change == ConnectionChange::Reconnected {
        info!(%device_id, "refreshing workload statuses after reconnection");
    }
    if update.device.connection == ConnectionState::Disconnected {
        // Statuses of a disconnected device are owned by its timer.
        return poll;
    }

    let candidates: Vec<(WorkloadKey, String, PodStatus)> = {
        let store = state.mappings_read().await;
        store
            .values()
            .filter(|mapping| mapping.device_id == device_id)
            .filter_map(|mapping| {
                let derived = status::derive_status(&update.snapshot, &mapping.app_name);
                if derived.is_none() {
                    debug!(
                        %device_id,
                        app = %mapping.app_name,
                        "mapped application missing from device; leaving it to resync"
                    );
                }
                let derived = derived?;
                let unchanged = mapping
                    .status
                    .as_ref()
                    .is_some_and(|current| current.same_state(&derived));
                (!unchanged).then(|| (mapping.key.clone(), mapping.uid.clone(), derived))
            })
            .collect()
    };

    poll.updated = apply_status_changes(state, candidates, Operation::Status).await;
    poll
}

async fn poll_failed(state: &SharedState, device_id: &str) -> DevicePoll {
    let failures = state::record_poll_failure(state, device_id).await;
    let threshold = state.cfg().poll_failure_threshold;
    let mut poll = DevicePoll {
        failed: true,
        ..Default::default()
    };
    if failures >= threshold {
        if let Some(transition) = state.registry().mark_disconnected(device_id).await {
            warn!(
                %device_id,
                failures,
                from = transition.from.as_str(),
                "device unreachable after consecutive poll failures"
            );
            poll.transitioned = true;
        }
        disconnect::observe_connection(state, device_id, ConnectionState::Disconnected).await;
    }
    poll
}

/// Writes derived statuses back into mappings still owned by the same uid and
/// announces them. Returns how many were applied.
pub(crate) async fn apply_status_changes(
    state: &SharedState,
    changes: Vec<(WorkloadKey, String, PodStatus)>,
    operation: Operation,
) -> usize {
    if changes.is_empty() {
        return 0;
    }
    let started = Instant::now();
    let applied: Vec<ManagedWorkload> = {
        let mut store = state.mappings_write().await;
        changes
            .into_iter()
            .filter_map(|(key, uid, status)| {
                let mapping = store.get_mut(&key).filter(|m| m.uid == uid)?;
                mapping.status = Some(status);
                Some(ManagedWorkload::from_mapping(mapping))
            })
            .collect()
    };

    let count = applied.len();
    for workload in applied {
        let actual = workload.status.as_ref().map(|s| s.phase);
        audit::record(
            state,
            ReconciliationRecord::new(workload.workload.key(), operation, Action::Update)
                .phases(Some(PodPhase::Running), actual)
                .took(started.elapsed()),
        )
        .await;
        state::notify_pod(state, PodEvent::StatusChanged(workload)).await;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::placement::create_workload;
    use crate::test_support::{FakeBackend, device_doc, state_with, workload_on};
    use crate::workload::ConditionStatus;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (SharedState, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        create_workload(&state, workload_on("web", "dev-1", 500, 1 << 20))
            .await
            .expect("placed");
        (state, backend)
    }

    fn key() -> WorkloadKey {
        WorkloadKey::new("default", "web")
    }

    #[tokio::test]
    async fn running_application_becomes_ready() {
        let (state, backend) = setup().await;
        backend.report_app("dev-1", "default-web", "Running");

        let summary = poll_once(&state).await;
        assert_eq!(summary.devices, 1);
        assert_eq!(summary.updated, 1);

        let status = state::mapping(&state, &key()).await.and_then(|m| m.status).expect("status");
        assert_eq!(status.phase, PodPhase::Running);
        assert_eq!(status.ready(), Some(ConditionStatus::True));
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let (state, backend) = setup().await;
        backend.report_app("dev-1", "default-web", "Running");
        poll_once(&state).await;
        let second = poll_once(&state).await;
        assert_eq!(second.updated, 0);
    }

    #[tokio::test]
    async fn declared_without_report_is_pending() {
        let (state, _backend) = setup().await;
        poll_once(&state).await;
        let status = state::mapping(&state, &key()).await.and_then(|m| m.status).expect("status");
        assert_eq!(status.phase, PodPhase::Pending);
        assert_eq!(status.reason.as_deref(), Some("ApplicationDeployed"));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failures_start_the_reconnection_timer() {
        let (state, backend) = setup().await;
        backend.fail_device("dev-1", true);

        for _ in 0..2 {
            let poll = poll_device(&state, "dev-1").await;
            assert!(poll.failed);
        }
        assert!(disconnect::active_tracker(&state, "dev-1").await.is_none());

        poll_device(&state, "dev-1").await;
        assert!(disconnect::active_tracker(&state, "dev-1").await.is_some());

        backend.fail_device("dev-1", false);
        backend.report_app("dev-1", "default-web", "Running");
        tokio::time::sleep(Duration::from_secs(30)).await;
        let poll = poll_device(&state, "dev-1").await;
        assert!(poll.transitioned);
        assert!(disconnect::active_tracker(&state, "dev-1").await.is_none());
        let status = state::mapping(&state, &key()).await.and_then(|m| m.status).expect("status");
        assert_eq!(status.phase, PodPhase::Running);
    }

    #[tokio::test]
    async fn devices_without_mappings_are_not_polled() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        let summary = poll_once(&state).await;
        assert_eq!(summary, PollSummary::default());
        assert_eq!(backend.get_calls(), 0);
    }
}

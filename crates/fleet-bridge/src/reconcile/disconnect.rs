//! Per-device reconnection timers.
//!
//! A timer starts when a device with mapped workloads is observed
//! `Disconnected`. Reconnecting before the deadline cancels it and keeps every
//! mapping; expiry evicts the workloads still mapped to the device. Cancel and
//! fire both claim the timer under the tracker lock, so exactly one of them
//! wins.

use std::collections::HashMap;
use std::time::{Duration, Instant as StdInstant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{MAX_RECONNECT_TIMEOUT_SECS, MIN_RECONNECT_TIMEOUT_SECS},
    models::ConnectionState,
    node,
    provider::{ManagedWorkload, PodEvent},
    error::BridgeError,
    reconcile::{
        audit::{self, Action, Operation, ReconciliationRecord},
        dispatch, result_label,
    },
    state::{self, PodDeviceMapping, SharedState},
    telemetry,
    workload::{PodPhase, PodStatus, WorkloadKey},
};

/// Pending eviction deadline for one disconnected device.
pub struct TimeoutTracker {
    pub device_id: String,
    pub disconnected_at: DateTime<Utc>,
    pub duration: Duration,
    pub deadline: Instant,
    /// Workloads mapped to the device when the timer started.
    pub affected: Vec<WorkloadKey>,
    generation: u64,
    cancel_tx: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Read-only view of a running timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerInfo {
    pub device_id: String,
    pub disconnected_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub affected: Vec<WorkloadKey>,
}

impl TimeoutTracker {
    fn info(&self) -> TrackerInfo {
        TrackerInfo {
            device_id: self.device_id.clone(),
            disconnected_at: self.disconnected_at,
            timeout_secs: self.duration.as_secs(),
            affected: self.affected.clone(),
        }
    }
}

#[derive(Default)]
pub struct TrackerSet {
    trackers: HashMap<String, TimeoutTracker>,
    next_generation: u64,
}

impl TrackerSet {
    pub fn contains(&self, device_id: &str) -> bool {
        self.trackers.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn infos(&self) -> Vec<TrackerInfo> {
        let mut infos: Vec<TrackerInfo> =
            self.trackers.values().map(TimeoutTracker::info).collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Removes the timer only if it is still the one identified by
    /// `generation`.
    fn claim(&mut self, device_id: &str, generation: u64) -> Option<TimeoutTracker> {
        if self
            .trackers
            .get(device_id)
            .is_some_and(|tracker| tracker.generation == generation)
        {
            self.trackers.remove(device_id)
        } else {
            None
        }
    }
}

/// What observing a connection state did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    None,
    TrackerStarted,
    /// A running timer was cancelled; the caller should refresh statuses.
    Reconnected,
}

/// Feeds one observed connection state into the timer machinery.
pub async fn observe_connection(
    state: &SharedState,
    device_id: &str,
    connection: ConnectionState,
) -> ConnectionChange {
    match connection {
        ConnectionState::Disconnected => {
            if start_tracker(state, device_id).await {
                ConnectionChange::TrackerStarted
            } else {
                ConnectionChange::None
            }
        }
        ConnectionState::Connected => {
            if cancel_tracker(state, device_id).await {
                ConnectionChange::Reconnected
            } else {
                ConnectionChange::None
            }
        }
        // Loss of contact with the backend says nothing about the device.
        ConnectionState::Unknown => ConnectionChange::None,
    }
}

fn timeout_for(state: &SharedState) -> Duration {
    state.cfg().reconnect_timeout().clamp(
        Duration::from_secs(MIN_RECONNECT_TIMEOUT_SECS),
        Duration::from_secs(MAX_RECONNECT_TIMEOUT_SECS),
    )
}

/// Starts a timer for `device_id` unless one is running or nothing is mapped
/// to the device. Affected workloads are reported as `Unknown`.
pub async fn start_tracker(state: &SharedState, device_id: &str) -> bool {
    let affected = state.mappings_read().await.keys_on_device(device_id);
    if affected.is_empty() {
        return false;
    }

    let duration = timeout_for(state);
    {
        let mut trackers = state.trackers().await;
        if trackers.contains(device_id) {
            return false;
        }
        trackers.next_generation += 1;
        let generation = trackers.next_generation;
        let deadline = Instant::now() + duration;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_timer(
            state.clone(),
            device_id.to_string(),
            generation,
            deadline,
            cancel_rx,
        ));
        trackers.trackers.insert(
            device_id.to_string(),
            TimeoutTracker {
                device_id: device_id.to_string(),
                disconnected_at: Utc::now(),
                duration,
                deadline,
                affected: affected.clone(),
                generation,
                cancel_tx,
                _task: task,
            },
        );
    }

    warn!(
        %device_id,
        workloads = affected.len(),
        timeout_secs = duration.as_secs(),
        "device disconnected; workloads will be evicted unless it reconnects"
    );

    let status = PodStatus::device_disconnected(device_id);
    let changed: Vec<ManagedWorkload> = {
        let mut store = state.mappings_write().await;
        affected
            .iter()
            .filter_map(|key| {
                let mapping = store.get_mut(key)?;
                if mapping.device_id != device_id {
                    return None;
                }
                mapping.status = Some(status.clone());
                Some(ManagedWorkload::from_mapping(mapping))
            })
            .collect()
    };
    for workload in changed {
        state::notify_pod(state, PodEvent::StatusChanged(workload)).await;
    }
    true
}

/// Cancels the timer for `device_id`. Idempotent; returns whether a running
/// timer was cancelled.
pub async fn cancel_tracker(state: &SharedState, device_id: &str) -> bool {
    let tracker = state.trackers().await.trackers.remove(device_id);
    match tracker {
        Some(tracker) => {
            let _ = tracker.cancel_tx.send(true);
            info!(
                %device_id,
                workloads = tracker.affected.len(),
                "device reconnected before deadline; keeping workloads"
            );
            true
        }
        None => false,
    }
}

/// Cancels every timer. Used on shutdown.
pub async fn cancel_all(state: &SharedState) -> usize {
    let drained: Vec<TimeoutTracker> = state
        .trackers()
        .await
        .trackers
        .drain()
        .map(|(_, tracker)| tracker)
        .collect();
    for tracker in &drained {
        let _ = tracker.cancel_tx.send(true);
    }
    drained.len()
}

pub async fn active_tracker(state: &SharedState, device_id: &str) -> Option<TrackerInfo> {
    state
        .trackers()
        .await
        .trackers
        .get(device_id)
        .map(TimeoutTracker::info)
}

pub async fn active_trackers(state: &SharedState) -> Vec<TrackerInfo> {
    state.trackers().await.infos()
}

async fn run_timer(
    state: SharedState,
    device_id: String,
    generation: u64,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {}
        _ = cancel.changed() => {
            debug!(%device_id, "reconnection timer cancelled");
            return;
        }
    }

    let Some(tracker) = state.trackers().await.claim(&device_id, generation) else {
        return;
    };
    evict(&state, &tracker).await;
}

/// Removes every workload still mapped to the tracker's device.
async fn evict(state: &SharedState, tracker: &TimeoutTracker) {
    let started = StdInstant::now();
    let device_id = tracker.device_id.as_str();
    let evicted: Vec<PodDeviceMapping> = {
        let mut store = state.mappings_write().await;
        store
            .keys_on_device(device_id)
            .iter()
            .filter_map(|key| store.remove(key))
            .collect()
    };

    telemetry::record_timeout_evictions(evicted.len());
    warn!(
        %device_id,
        evicted = evicted.len(),
        timeout_secs = tracker.duration.as_secs(),
        "device did not reconnect before deadline; workloads evicted"
    );

    let status = PodStatus::device_unreachable(device_id, tracker.duration);
    for mapping in &evicted {
        state::notify_pod(
            state,
            PodEvent::Evicted {
                key: mapping.key.clone(),
                uid: mapping.uid.clone(),
                device_id: device_id.to_string(),
                status: status.clone(),
            },
        )
        .await;
    }

    for mapping in &evicted {
        let record =
            ReconciliationRecord::new(mapping.key.clone(), Operation::Timeout, Action::Remove)
                .phases(None, Some(PodPhase::Failed));
        let result = dispatch::remove_application(state, device_id, &mapping.app_name)
            .await
            .map_err(BridgeError::from);
        let record = match &result {
            Ok(_) => record,
            Err(err) => {
                debug!(
                    %device_id,
                    app = %mapping.app_name,
                    ?err,
                    "could not remove application from unreachable device"
                );
                record.failed(audit::Outcome::Retry, err)
            }
        };
        audit::record(state, record.took(started.elapsed())).await;
        telemetry::record_reconcile(
            Operation::Timeout.label(),
            result_label(&result),
            started.elapsed(),
        );
    }

    state.registry().invalidate_snapshot(device_id).await;
    node::maybe_notify_node(state, true).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::placement::create_workload;
    use crate::test_support::{FakeBackend, device_doc, state_with, workload_on};
    use std::sync::{Arc, Mutex as StdMutex};

    async fn placed(backend: &Arc<FakeBackend>) -> SharedState {
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(backend);
        create_workload(&state, workload_on("web", "dev-1", 500, 1 << 20))
            .await
            .expect("placed");
        state
    }

    async fn capture(state: &SharedState) -> Arc<StdMutex<Vec<PodEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let notifier: crate::provider::PodNotifier = Arc::new(move |event| {
            sink.lock().expect("events").push(event);
        });
        state::set_pod_notifier(state, notifier).await;
        events
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_before_deadline_keeps_mappings() {
        let backend = Arc::new(FakeBackend::default());
        let state = placed(&backend).await;

        assert_eq!(
            observe_connection(&state, "dev-1", ConnectionState::Disconnected).await,
            ConnectionChange::TrackerStarted
        );
        let key = WorkloadKey::new("default", "web");
        let status = state::mapping(&state, &key)
            .await
            .and_then(|m| m.status)
            .expect("status");
        assert_eq!(status.phase, PodPhase::Unknown);

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(
            observe_connection(&state, "dev-1", ConnectionState::Connected).await,
            ConnectionChange::Reconnected
        );
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(state::mapping(&state, &key).await.is_some());
        assert!(active_tracker(&state, "dev-1").await.is_none());
        assert!(!cancel_tracker(&state, "dev-1").await, "cancel is idempotent");
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_evicts_mapped_workloads() {
        let backend = Arc::new(FakeBackend::default());
        let state = placed(&backend).await;
        let events = capture(&state).await;

        observe_connection(&state, "dev-1", ConnectionState::Disconnected).await;
        let info = active_tracker(&state, "dev-1").await.expect("tracker");
        assert_eq!(info.timeout_secs, 300);
        assert_eq!(info.affected, vec![WorkloadKey::new("default", "web")]);

        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(state.mappings_read().await.is_empty());
        assert!(active_tracker(&state, "dev-1").await.is_none());
        assert!(backend.declared_apps("dev-1").is_empty());
        let events = events.lock().expect("events");
        assert!(events.iter().any(|event| matches!(
            event,
            PodEvent::Evicted { status, .. }
                if status.phase == PodPhase::Failed
                    && status.reason.as_deref() == Some("DeviceUnreachable")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_backout_on_expiry_is_recorded_for_retry() {
        let backend = Arc::new(FakeBackend::default());
        let state = placed(&backend).await;

        observe_connection(&state, "dev-1", ConnectionState::Disconnected).await;
        backend.fail_device("dev-1", true);
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(state.mappings_read().await.is_empty());
        assert_eq!(backend.declared_apps("dev-1"), vec!["default-web"]);
        let records = audit::records(&state).await;
        let timeout = records
            .iter()
            .find(|record| record.operation == Operation::Timeout)
            .expect("timeout record");
        assert_eq!(timeout.outcome, audit::Outcome::Retry);
        assert!(timeout.error.as_deref().is_some_and(|e| e.contains("unreachable")));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnect_keeps_the_original_deadline() {
        let backend = Arc::new(FakeBackend::default());
        let state = placed(&backend).await;

        observe_connection(&state, "dev-1", ConnectionState::Disconnected).await;
        let first = state.trackers().await.trackers["dev-1"].deadline;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            observe_connection(&state, "dev-1", ConnectionState::Disconnected).await,
            ConnectionChange::None
        );
        assert_eq!(state.trackers().await.trackers["dev-1"].deadline, first);
    }

    #[tokio::test]
    async fn devices_without_workloads_get_no_timer() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-2", "Offline", "4", "8Gi"));
        let state = state_with(&backend);
        assert_eq!(
            observe_connection(&state, "dev-2", ConnectionState::Disconnected).await,
            ConnectionChange::None
        );
        assert_eq!(
            observe_connection(&state, "dev-2", ConnectionState::Unknown).await,
            ConnectionChange::None
        );
        assert!(state.trackers().await.is_empty());
    }
}

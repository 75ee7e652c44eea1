use std::time::{Duration, Instant};

use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    error::BridgeError,
    models::ConnectionState,
    node,
    state::SharedState,
    telemetry,
    workload::{PodPhase, WorkloadKey},
};

pub mod audit;
pub mod disconnect;
pub mod dispatch;
pub mod placement;
pub mod removal;
pub mod replace;
pub mod resync;
pub mod status_poll;

use audit::{Action, Operation, Outcome, ReconciliationRecord};

/// Drives the periodic work of the bridge until `shutdown` fires: registry
/// refresh, status polling and the full resync. The first tick of each runs
/// immediately, registry first.
pub async fn reconcile_loop(
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let cfg = state.cfg();
    let mut refresh = tokio::time::interval(cfg.device_refresh_interval());
    let mut poll = tokio::time::interval(cfg.status_poll_interval());
    let mut resync = tokio::time::interval(cfg.full_resync_interval());
    for ticker in [&mut refresh, &mut poll, &mut resync] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = refresh.tick() => {
                refresh_registry_once(&state)
                    .instrument(info_span!("registry_refresh"))
                    .await;
            }
            _ = poll.tick() => {
                status_poll::poll_once(&state)
                    .instrument(info_span!("status_poll"))
                    .await;
            }
            _ = resync.tick() => {
                resync::resync_once(&state)
                    .instrument(info_span!("resync"))
                    .await;
            }
        }
    }

    let cancelled = disconnect::cancel_all(&state).await;
    if cancelled > 0 {
        info!(cancelled, "cancelled pending reconnection timers on shutdown");
    }
    Ok(())
}

/// Refreshes the device registry and reacts to observed connection changes.
pub async fn refresh_registry_once(state: &SharedState) -> ReconcileOutcome {
    let report = match state.registry().refresh_devices().await {
        Ok(report) => report,
        Err(err) => {
            warn!(?err, "device registry refresh failed; serving cached devices");
            return ReconcileOutcome::BackendUnavailable;
        }
    };
    debug!(
        listed = report.listed,
        transitions = report.transitions.len(),
        removed = report.removed.len(),
        "device registry refreshed"
    );

    for transition in &report.transitions {
        info!(
            device_id = %transition.device_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "device connection changed"
        );
        let change =
            disconnect::observe_connection(state, &transition.device_id, transition.to).await;
        if change == disconnect::ConnectionChange::Reconnected {
            status_poll::poll_device(state, &transition.device_id).await;
        }
    }

    // Devices that were already disconnected when mappings were adopted have
    // no transition to report.
    for device in state.registry().devices().await {
        if device.connection == ConnectionState::Disconnected {
            disconnect::observe_connection(state, &device.id, device.connection).await;
        }
    }

    node::maybe_notify_node(state, !report.transitions.is_empty()).await;
    ReconcileOutcome::Applied
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Partial,
    BackendUnavailable,
}

impl ReconcileOutcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "success",
            ReconcileOutcome::Partial => "partial",
            ReconcileOutcome::BackendUnavailable => "backend_unavailable",
        }
    }
}

pub(crate) fn outcome_for(err: &BridgeError) -> Outcome {
    if err.is_retryable() {
        Outcome::Retry
    } else {
        Outcome::Failed
    }
}

/// Records metrics and an audit entry for one orchestrator-driven operation.
pub(crate) async fn finish<T>(
    state: &SharedState,
    key: &WorkloadKey,
    operation: Operation,
    action: Action,
    actual: Option<PodPhase>,
    started: Instant,
    result: &Result<T, BridgeError>,
) {
    let elapsed = started.elapsed();
    let desired = match operation {
        Operation::Delete => None,
        _ => Some(PodPhase::Running),
    };
    let record = ReconciliationRecord::new(key.clone(), operation, action)
        .phases(desired, actual)
        .took(elapsed);
    let record = match result {
        Ok(_) => record,
        Err(err) => record.failed(outcome_for(err), err),
    };
    telemetry::record_reconcile(operation.label(), result_label(result), elapsed);
    audit::record(state, record).await;
}

/// Metric label for the result of one operation.
pub(crate) fn result_label<T>(result: &Result<T, BridgeError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(err) => err.kind().label(),
    }
}

/// Elapsed time of background passes, for logging.
pub(crate) fn millis(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

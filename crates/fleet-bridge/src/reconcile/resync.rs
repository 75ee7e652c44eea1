//! Full resync between the orchestrator's workload list, the mapping table and
//! what devices actually declare.
//!
//! The mapping table is only a cache: after a restart it starts empty and the
//! first resync adopts every application that is already declared on a device.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    models::ConnectionState,
    reconcile::{
        audit::{self, Action, Operation, ReconciliationRecord},
        disconnect, dispatch, millis, placement, removal,
        status_poll::apply_status_changes,
    },
    state::{self, PodDeviceMapping, SharedState},
    status, translator,
    workload::{PodPhase, PodStatus, Workload, WorkloadKey},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub adopted: usize,
    pub placed: usize,
    pub orphaned: usize,
    pub redeployed: usize,
    pub refreshed: usize,
    pub errors: usize,
}

pub async fn resync_once(state: &SharedState) -> ResyncSummary {
    let started = Instant::now();
    let mut summary = ResyncSummary::default();

    match state::workload_source(state).await {
        Some(source) => {
            // Only mappings that existed before the listing was taken can be
            // judged against it.
            let known = state::all_mappings(state).await;
            match source.list_workloads().await {
                Ok(workloads) => reconcile_with(state, known, workloads, &mut summary).await,
                Err(err) => {
                    warn!(?err, "could not list workloads; resync limited to mapped workloads");
                    summary.errors += 1;
                }
            }
        }
        None => debug!("no workload source registered; skipping adoption"),
    }

    refresh_mapped(state, &mut summary).await;

    state.lock().await.last_resync = Some(Utc::now());
    info!(
        adopted = summary.adopted,
        placed = summary.placed,
        orphaned = summary.orphaned,
        redeployed = summary.redeployed,
        refreshed = summary.refreshed,
        errors = summary.errors,
        elapsed_ms = millis(started.elapsed()),
        "resync complete"
    );
    summary
}

async fn reconcile_with(
    state: &SharedState,
    known: Vec<PodDeviceMapping>,
    workloads: Vec<Workload>,
    summary: &mut ResyncSummary,
) {
    let live: HashMap<WorkloadKey, Workload> =
        workloads.into_iter().map(|w| (w.key(), w)).collect();

    // Mappings whose workload is gone or was recreated under a new uid.
    let orphans: Vec<PodDeviceMapping> = {
        let table = state.placements();
        known
            .into_iter()
            .filter(|mapping| !table.contains(&mapping.key))
            .filter(|mapping| {
                live.get(&mapping.key)
                    .is_none_or(|workload| workload.uid != mapping.uid)
            })
            .collect()
    };
    for mapping in orphans {
        let current = state::mapping(state, &mapping.key).await;
        if current.is_none_or(|current| current.uid != mapping.uid) {
            debug!(workload = %mapping.key, "mapping changed during resync; leaving it");
            continue;
        }
        let record =
            ReconciliationRecord::new(mapping.key.clone(), Operation::Resync, Action::Remove);
        match removal::remove_mapped(state, &mapping).await {
            Ok(_) => {
                info!(
                    workload = %mapping.key,
                    device_id = %mapping.device_id,
                    "removed orphaned workload"
                );
                summary.orphaned += 1;
                audit::record(state, record).await;
            }
            Err(err) => {
                warn!(workload = %mapping.key, ?err, "failed to remove orphaned workload");
                summary.errors += 1;
                audit::record(state, record.failed(audit::Outcome::Retry, &err)).await;
            }
        }
    }

    let mut pending: Vec<Workload> = Vec::new();
    {
        let store = state.mappings_read().await;
        let table = state.placements();
        for (key, workload) in live {
            if store.get(&key).is_none() && !table.contains(&key) {
                pending.push(workload);
            }
        }
    }
    pending.sort_by_key(Workload::key);

    for workload in pending {
        if adopt(state, &workload).await {
            summary.adopted += 1;
            continue;
        }
        match placement::create_workload(state, workload).await {
            Ok(_) => summary.placed += 1,
            Err(_) => summary.errors += 1,
        }
    }
}

/// Records a mapping for `workload` if some device already declares its
/// application.
async fn adopt(state: &SharedState, workload: &Workload) -> bool {
    let key = workload.key();
    let app_name = key.app_name();
    let request = workload.placement_request(state.cfg().default_device_id.as_deref());
    let candidates: Vec<String> = match request {
        Ok(request) if request.device_id.is_some() => request.device_id.into_iter().collect(),
        _ => state
            .registry()
            .devices()
            .await
            .into_iter()
            .map(|device| device.id)
            .collect(),
    };

    for device_id in candidates {
        let snapshot = match state.registry().get_snapshot(&device_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(%device_id, ?err, "skipping device during adoption");
                continue;
            }
        };
        if !snapshot.declared.contains(&app_name) {
            continue;
        }

        let status = status::derive_status(&snapshot, &app_name);
        let adopted = {
            let mut store = state.mappings_write().await;
            if store.get(&key).is_some() {
                false
            } else {
                store.insert(PodDeviceMapping::new(workload.clone(), &device_id, status.clone()));
                true
            }
        };
        if adopted {
            info!(workload = %key, %device_id, "adopted existing application");
            audit::record(
                state,
                ReconciliationRecord::new(key.clone(), Operation::Resync, Action::Adopt)
                    .phases(Some(PodPhase::Running), status.map(|s| s.phase)),
            )
            .await;
        }
        return true;
    }
    false
}

/// Re-derives every mapped status from scratch and redeploys applications
/// that vanished from a connected device.
async fn refresh_mapped(state: &SharedState, summary: &mut ResyncSummary) {
    let mut by_device: BTreeMap<String, Vec<PodDeviceMapping>> = BTreeMap::new();
    for mapping in state::all_mappings(state).await {
        by_device.entry(mapping.device_id.clone()).or_default().push(mapping);
    }

    for (device_id, mappings) in by_device {
        if disconnect::active_tracker(state, &device_id).await.is_some() {
            continue;
        }
        let update = match state.registry().refresh_snapshot(&device_id).await {
            Ok(update) => update,
            Err(err) => {
                debug!(%device_id, ?err, "device unavailable during resync");
                summary.errors += 1;
                continue;
            }
        };
        if update.device.connection != ConnectionState::Connected {
            continue;
        }

        let mut changes = Vec::new();
        for mapping in mappings {
            if let Some(derived) = status::derive_status(&update.snapshot, &mapping.app_name) {
                let unchanged = mapping
                    .status
                    .as_ref()
                    .is_some_and(|current| current.same_state(&derived));
                if !unchanged {
                    changes.push((mapping.key.clone(), mapping.uid.clone(), derived));
                }
                continue;
            }

            match redeploy(state, &mapping).await {
                Ok(()) => {
                    summary.redeployed += 1;
                    changes.push((
                        mapping.key.clone(),
                        mapping.uid.clone(),
                        PodStatus::scheduled(&device_id),
                    ));
                }
                Err(err) => {
                    warn!(workload = %mapping.key, %device_id, error = %err, "redeploy failed");
                    summary.errors += 1;
                }
            }
        }
        summary.refreshed += apply_status_changes(state, changes, Operation::Resync).await;
    }
}

async fn redeploy(
    state: &SharedState,
    mapping: &PodDeviceMapping,
) -> Result<(), crate::error::BridgeError> {
    let app = translator::to_application(&mapping.workload)?;
    let app_name = app.name.clone();
    dispatch::deploy_application(state, &mapping.device_id, app).await?;
    state.registry().invalidate_snapshot(&mapping.device_id).await;

    let still_mapped = state::mapping(state, &mapping.key)
        .await
        .is_some_and(|current| current.uid == mapping.uid);
    if !still_mapped {
        debug!(workload = %mapping.key, "workload deleted during redeploy; backing out");
        dispatch::remove_application(state, &mapping.device_id, &app_name).await?;
        return Ok(());
    }
    info!(
        workload = %mapping.key,
        device_id = %mapping.device_id,
        "redeployed missing application"
    );
    audit::record(
        state,
        ReconciliationRecord::new(mapping.key.clone(), Operation::Resync, Action::Deploy)
            .phases(Some(PodPhase::Running), None),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DynWorkloadSource, WorkloadSource};
    use crate::test_support::{FakeBackend, device_doc, state_with, workload_on};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct StaticSource(StdMutex<Vec<Workload>>);

    #[async_trait]
    impl WorkloadSource for StaticSource {
        async fn list_workloads(&self) -> anyhow::Result<Vec<Workload>> {
            Ok(self.0.lock().expect("workloads").clone())
        }
    }

    async fn with_source(state: &SharedState, workloads: Vec<Workload>) -> Arc<StaticSource> {
        let source = Arc::new(StaticSource(StdMutex::new(workloads)));
        state::set_workload_source(state, source.clone() as DynWorkloadSource).await;
        source
    }

    #[tokio::test]
    async fn restart_adopts_declared_applications() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let web = workload_on("web", "dev-1", 500, 0);

        let before = state_with(&backend);
        placement::create_workload(&before, web.clone())
            .await
            .expect("placed");
        backend.report_app("dev-1", "default-web", "Running");
        let puts = backend.put_calls();

        // Fresh process: empty mapping table.
        let after = state_with(&backend);
        with_source(&after, vec![web]).await;
        let summary = resync_once(&after).await;

        assert_eq!(summary.adopted, 1);
        assert_eq!(summary.placed, 0);
        assert_eq!(backend.put_calls(), puts);
        let mapping = state::mapping(&after, &WorkloadKey::new("default", "web"))
            .await
            .expect("adopted");
        assert_eq!(mapping.device_id, "dev-1");
        assert_eq!(mapping.status.map(|s| s.phase), Some(PodPhase::Running));
    }

    #[tokio::test]
    async fn orphans_are_removed_and_missing_workloads_placed() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        placement::create_workload(&state, workload_on("old", "dev-1", 100, 0))
            .await
            .expect("placed");

        with_source(&state, vec![workload_on("new", "dev-1", 100, 0)]).await;
        let summary = resync_once(&state).await;

        assert_eq!(summary.orphaned, 1);
        assert_eq!(summary.placed, 1);
        assert_eq!(backend.declared_apps("dev-1"), vec!["default-new"]);
    }

    #[tokio::test]
    async fn vanished_application_is_redeployed() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        placement::create_workload(&state, workload_on("web", "dev-1", 100, 0))
            .await
            .expect("placed");

        // Someone edits the device behind the bridge's back.
        let mut doc = backend.device("dev-1").expect("device");
        doc.spec.applications.clear();
        backend.put_device(doc);

        let summary = resync_once(&state).await;
        assert_eq!(summary.redeployed, 1);
        assert_eq!(backend.declared_apps("dev-1"), vec!["default-web"]);
    }

    /// Lists the orchestrator's view as it was before a create landed.
    struct LaggingSource {
        state: SharedState,
        fresh: Workload,
    }

    #[async_trait]
    impl WorkloadSource for LaggingSource {
        async fn list_workloads(&self) -> anyhow::Result<Vec<Workload>> {
            let listed = Vec::new();
            placement::create_workload(&self.state, self.fresh.clone())
                .await
                .expect("placed");
            Ok(listed)
        }
    }

    #[tokio::test]
    async fn workload_created_during_listing_is_not_an_orphan() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        let source = Arc::new(LaggingSource {
            state: state.clone(),
            fresh: workload_on("fresh", "dev-1", 100, 0),
        });
        state::set_workload_source(&state, source as DynWorkloadSource).await;

        let summary = resync_once(&state).await;

        assert_eq!(summary.orphaned, 0);
        assert!(
            state::mapping(&state, &WorkloadKey::new("default", "fresh"))
                .await
                .is_some()
        );
        assert_eq!(backend.declared_apps("dev-1"), vec!["default-fresh"]);
    }

    #[tokio::test]
    async fn in_flight_placement_is_left_alone() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        placement::create_workload(&state, workload_on("web", "dev-1", 100, 0))
            .await
            .expect("placed");
        with_source(&state, Vec::new()).await;

        let key = WorkloadKey::new("default", "web");
        let id = state
            .placements()
            .reserve(&key, "dev-1", crate::models::ResourceList::ZERO);
        let guard = state.guard_placement(&key, id);
        let summary = resync_once(&state).await;
        drop(guard);

        assert_eq!(summary.orphaned, 0);
        assert!(state::mapping(&state, &key).await.is_some());
    }
}

//! Workload updates: the application is removed, then redeployed on the same
//! device. The device does not change even if placement annotations did. A
//! delete that lands while the redeploy is in flight wins; the update backs
//! its application out and records no mapping.

use std::time::Instant;

use tracing::{info, warn};

use crate::{
    error::BridgeError,
    models::Device,
    provider::{ManagedWorkload, PodEvent},
    reconcile::{
        audit::{Action, Operation},
        dispatch, finish,
    },
    selector,
    state::{self, PodDeviceMapping, SharedState},
    translator,
    workload::{PodPhase, PodStatus, Workload},
};

pub async fn update_workload(state: &SharedState, workload: Workload) -> Result<(), BridgeError> {
    let started = Instant::now();
    let key = workload.key();
    let result = replace(state, workload).await;
    finish(
        state,
        &key,
        Operation::Update,
        Action::Replace,
        result.is_ok().then_some(PodPhase::Pending),
        started,
        &result,
    )
    .await;
    if let Err(err) = &result {
        warn!(workload = %key, error = %err, kind = err.kind().label(), "update failed");
    }
    result
}

async fn replace(state: &SharedState, workload: Workload) -> Result<(), BridgeError> {
    let key = workload.key();
    let existing = state::mapping(state, &key)
        .await
        .ok_or_else(|| BridgeError::WorkloadNotFound {
            key: key.to_string(),
        })?;
    let device_id = existing.device_id.clone();
    let requested = workload.requested_resources();

    let device = state.registry().get_device(&device_id).await?;
    let snapshot = state.registry().get_snapshot(&device_id).await?;
    let target = Device {
        allocatable: snapshot.allocatable,
        ..device
    };

    // Admission on the same device, not counting the workload's own request.
    // The reservation lets a concurrent delete cancel the update.
    let guard = {
        let store = state.mappings_read().await;
        let mut table = state.placements();
        let mut loads = store.loads(Some(&key));
        table.add_reservations(&mut loads, Some(&key));
        selector::admit(&target, requested, loads.get(&device_id))?;
        let id = table.reserve(&key, &device_id, requested);
        drop(table);
        state.guard_placement(&key, id)
    };

    // Render before touching the device so a bad workload leaves the old app.
    let app = translator::to_application(&workload)?;
    let app_name = app.name.clone();

    dispatch::remove_application(state, &device_id, &existing.app_name).await?;
    if let Err(err) = dispatch::deploy_application(state, &device_id, app).await {
        let mut store = state.mappings_write().await;
        if store
            .get(&key)
            .is_some_and(|current| current.uid == existing.uid)
        {
            store.remove(&key);
        }
        warn!(workload = %key, %device_id, "redeploy failed after removal; mapping dropped");
        return Err(err.into());
    }

    let status = PodStatus::scheduled(&device_id);
    let committed = {
        let mut store = state.mappings_write().await;
        let mut table = state.placements();
        let live = store
            .get(&key)
            .is_some_and(|current| current.uid == existing.uid);
        if !live || table.is_cancelled(&key, guard.id()) {
            false
        } else {
            table.release(&key, guard.id());
            drop(table);
            store.insert(PodDeviceMapping::new(
                workload.clone(),
                &device_id,
                Some(status.clone()),
            ));
            true
        }
    };
    drop(guard);
    state.registry().invalidate_snapshot(&device_id).await;

    if !committed {
        info!(workload = %key, %device_id, "workload deleted during update; backing out");
        if let Err(err) = dispatch::remove_application(state, &device_id, &app_name).await {
            warn!(workload = %key, %device_id, ?err, "failed to back out cancelled update");
        }
        return Err(BridgeError::WorkloadNotFound {
            key: key.to_string(),
        });
    }
    info!(workload = %key, %device_id, "workload updated");

    state::notify_pod(
        state,
        PodEvent::StatusChanged(ManagedWorkload {
            workload,
            device_id,
            status: Some(status),
        }),
    )
    .await;
    Ok(())
}

//! Workload creation: select a device, admit, dispatch, then commit the
//! mapping.
//!
//! Admission and the in-flight reservation happen under the mapping read lock
//! and the placement table lock together, so two concurrent placements can
//! never both claim the last free capacity of a device. A delete that arrives
//! while the dispatch is in flight cancels the reservation; the commit step
//! then backs the application out instead of recording a mapping.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, PlacementError},
    models::Device,
    provider::{ManagedWorkload, PodEvent},
    reconcile::{
        audit::{Action, Operation},
        dispatch, finish, removal,
    },
    registry::RegistryError,
    selector,
    state::{self, PodDeviceMapping, SharedState},
    translator,
    workload::{PodPhase, PodStatus, Workload},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed { device_id: String },
    /// Same uid already mapped; nothing to do.
    AlreadyPlaced { device_id: String },
    /// A concurrent delete won; the application was backed out.
    Cancelled,
}

/// Places `workload` on exactly one device.
pub async fn create_workload(
    state: &SharedState,
    workload: Workload,
) -> Result<PlaceOutcome, BridgeError> {
    let started = Instant::now();
    let key = workload.key();
    let result = place(state, &workload).await;

    let (action, actual) = match &result {
        Ok(PlaceOutcome::AlreadyPlaced { .. }) => (Action::None, None),
        Ok(PlaceOutcome::Cancelled) => (Action::Remove, None),
        _ => (Action::Deploy, Some(PodPhase::Pending)),
    };
    finish(state, &key, Operation::Create, action, actual, started, &result).await;
    match &result {
        Ok(PlaceOutcome::Placed { device_id }) => {
            info!(workload = %key, %device_id, "workload placed");
        }
        Err(err) => {
            warn!(workload = %key, error = %err, kind = err.kind().label(), "placement failed");
        }
        Ok(_) => {}
    }
    result
}

async fn place(state: &SharedState, workload: &Workload) -> Result<PlaceOutcome, BridgeError> {
    let key = workload.key();

    if let Some(existing) = state::mapping(state, &key).await {
        if existing.uid == workload.uid {
            debug!(workload = %key, device_id = %existing.device_id, "already placed");
            return Ok(PlaceOutcome::AlreadyPlaced {
                device_id: existing.device_id,
            });
        }
        info!(
            workload = %key,
            old_uid = %existing.uid,
            "workload recreated; replacing previous placement"
        );
        removal::remove_mapped(state, &existing).await?;
    }

    let request = workload.placement_request(state.cfg().default_device_id.as_deref())?;
    let requested = workload.requested_resources();

    let mut devices = state.registry().devices().await;
    if let Some(device_id) = &request.device_id {
        if !devices.iter().any(|device| &device.id == device_id) {
            match state.registry().get_device(device_id).await {
                Ok(device) => devices.push(device),
                // Reported by the selector as DeviceNotFound.
                Err(RegistryError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    let loads = state::committed_loads(state, Some(&key)).await;
    let chosen = selector::select_device(&request, requested, &devices, &loads)?;
    debug!(
        workload = %key,
        criteria = %request.describe(),
        device_id = %chosen.id,
        "device selected"
    );

    // Admission runs against fresh capacity, not the listing.
    let snapshot = state.registry().get_snapshot(&chosen.id).await?;
    let target = Device {
        phase: snapshot.phase,
        connection: snapshot.connection,
        allocatable: snapshot.allocatable,
        ..chosen
    };
    if !target.is_schedulable() {
        return Err(PlacementError::DeviceNotReady {
            device_id: target.id,
            phase: target.phase,
            connection: target.connection,
        }
        .into());
    }

    let guard = {
        let store = state.mappings_read().await;
        let mut table = state.placements();
        let mut loads = store.loads(Some(&key));
        table.add_reservations(&mut loads, Some(&key));
        selector::admit(&target, requested, loads.get(&target.id))?;
        let id = table.reserve(&key, &target.id, requested);
        drop(table);
        state.guard_placement(&key, id)
    };

    let app = translator::to_application(workload)?;
    let app_name = app.name.clone();
    dispatch::deploy_application(state, &target.id, app).await?;

    let status = PodStatus::scheduled(&target.id);
    let committed = {
        let mut store = state.mappings_write().await;
        let mut table = state.placements();
        if table.is_cancelled(&key, guard.id()) {
            false
        } else {
            table.release(&key, guard.id());
            drop(table);
            store.insert(PodDeviceMapping::new(
                workload.clone(),
                &target.id,
                Some(status.clone()),
            ));
            true
        }
    };
    drop(guard);
    state.registry().invalidate_snapshot(&target.id).await;

    if !committed {
        info!(
            workload = %key,
            device_id = %target.id,
            "placement cancelled by delete; backing out"
        );
        if let Err(err) = dispatch::remove_application(state, &target.id, &app_name).await {
            warn!(
                workload = %key,
                device_id = %target.id,
                ?err,
                "failed to back out cancelled placement"
            );
        }
        return Ok(PlaceOutcome::Cancelled);
    }

    state::notify_pod(
        state,
        PodEvent::StatusChanged(ManagedWorkload {
            workload: workload.clone(),
            device_id: target.id.clone(),
            status: Some(status),
        }),
    )
    .await;
    Ok(PlaceOutcome::Placed {
        device_id: target.id,
    })
}

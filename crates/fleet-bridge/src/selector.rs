//! Device selection and the resource admission gate.
//!
//! Both are pure functions over a registry snapshot and the committed load per
//! device, so identical inputs always yield the identical device.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::PlacementError;
use crate::models::{Device, ResourceList};
use crate::workload::PlacementRequest;

/// Resources already committed to a device by mapped workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceLoad {
    pub workloads: usize,
    pub committed: ResourceList,
}

impl DeviceLoad {
    pub fn add(&mut self, requested: ResourceList) {
        self.workloads += 1;
        self.committed = self.committed.saturating_add(requested);
    }
}

pub type LoadMap = HashMap<String, DeviceLoad>;

/// Allocatable capacity not yet committed on `device`.
pub fn available(device: &Device, load: Option<&DeviceLoad>) -> ResourceList {
    match load {
        Some(load) => device.allocatable.saturating_sub(load.committed),
        None => device.allocatable,
    }
}

/// Admission gate: the request must fit in what is left on the device.
pub fn admit(
    device: &Device,
    requested: ResourceList,
    load: Option<&DeviceLoad>,
) -> Result<(), PlacementError> {
    let available = available(device, load);
    if requested.fits_within(&available) {
        Ok(())
    } else {
        Err(PlacementError::InsufficientResources {
            device_id: device.id.clone(),
            requested,
            available,
        })
    }
}

fn rank(a: &(&Device, ResourceList, usize), b: &(&Device, ResourceList, usize)) -> Ordering {
    b.1.cpu_millis
        .cmp(&a.1.cpu_millis)
        .then_with(|| a.2.cmp(&b.2))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

/// Picks exactly one device for `request`.
///
/// An explicit device id is only checked for existence and eligibility; the
/// admission gate decides whether it has room.
pub fn select_device(
    request: &PlacementRequest,
    requested: ResourceList,
    devices: &[Device],
    loads: &LoadMap,
) -> Result<Device, PlacementError> {
    if let Some(device_id) = &request.device_id {
        let device = devices
            .iter()
            .find(|device| &device.id == device_id)
            .ok_or_else(|| PlacementError::DeviceNotFound {
                device_id: device_id.clone(),
            })?;
        if !device.is_schedulable() {
            return Err(PlacementError::DeviceNotReady {
                device_id: device.id.clone(),
                phase: device.phase,
                connection: device.connection,
            });
        }
        return Ok(device.clone());
    }

    let matching: Vec<&Device> = devices
        .iter()
        .filter(|device| match &request.fleet_id {
            Some(fleet) => device.fleet_id.as_deref() == Some(fleet.as_str()),
            None => true,
        })
        .filter(|device| device.matches_labels(&request.selector))
        .collect();

    let ready: Vec<(&Device, ResourceList, usize)> = matching
        .iter()
        .copied()
        .filter(|device| device.is_schedulable())
        .map(|device| {
            let load = loads.get(&device.id);
            (
                device,
                available(device, load),
                load.map(|l| l.workloads).unwrap_or(0),
            )
        })
        .collect();

    let mut fitting: Vec<_> = ready
        .iter()
        .filter(|(_, available, _)| requested.fits_within(available))
        .cloned()
        .collect();

    if fitting.is_empty() {
        if let Some(best) = ready.iter().min_by(|a, b| rank(a, b)) {
            return Err(PlacementError::InsufficientResources {
                device_id: best.0.id.clone(),
                requested,
                available: best.1,
            });
        }
        let reason = if matching.is_empty() {
            "no device matches the criteria".to_string()
        } else {
            format!(
                "none of the {} matching device(s) is Ready and Connected",
                matching.len()
            )
        };
        return Err(PlacementError::NoSuitableDevice {
            criteria: request.describe(),
            considered: devices.len(),
            reason,
        });
    }

    fitting.sort_by(rank);
    Ok(fitting[0].0.clone())
}

//! Fixtures and an in-memory backend, shared by unit tests and, behind the
//! `test-utils` feature, the integration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use common::api::{
    ApplicationStatus, DeviceDocument, DeviceStatus, DevicesSummary, FleetDocument, FleetStatus,
    ObjectMeta, ResourceQuantities, StatusSummary,
};

use crate::{
    backend::{BackendError, FleetBackend},
    config,
    state::SharedState,
    workload::{ContainerSpec, DEVICE_ANNOTATION, ResourceRequests, Workload},
};

pub fn base_config() -> config::AppConfig {
    config::AppConfig {
        node_name: "fleet-bridge".into(),
        backend_url: "http://localhost:3443".into(),
        token_url: "http://localhost:8080/token".into(),
        client_id: "bridge".into(),
        client_secret: "secret".into(),
        allow_insecure_http: true,
        tls_insecure_skip_verify: false,
        ca_cert_path: None,
        request_timeout_secs: 5,
        token_expiry_margin_secs: 30,
        status_poll_interval_secs: 15,
        full_resync_interval_secs: 300,
        device_refresh_interval_secs: 60,
        snapshot_ttl_secs: 30,
        reconnect_timeout_secs: 300,
        poll_failure_threshold: 3,
        device_grace_period_secs: 900,
        default_device_id: None,
        system_reserved_cpu_millis: 0,
        system_reserved_memory_bytes: 0,
        capacity_noise_cpu_millis: 100,
        capacity_noise_memory_bytes: 64 << 20,
        node_labels: HashMap::new(),
        metrics_host: "127.0.0.1".into(),
        metrics_port: 9092,
    }
}

/// Device document with a summary status and a reported capacity.
pub fn device_doc(id: &str, summary: &str, cpu: &str, memory: &str) -> DeviceDocument {
    DeviceDocument {
        api_version: "v1alpha1".into(),
        kind: "Device".into(),
        metadata: ObjectMeta {
            name: id.into(),
            ..Default::default()
        },
        status: Some(DeviceStatus {
            summary: Some(StatusSummary {
                status: summary.into(),
                info: None,
            }),
            capacity: Some(ResourceQuantities {
                cpu: Some(cpu.into()),
                memory: Some(memory.into()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn workload(name: &str, annotations: &[(&str, &str)]) -> Workload {
    Workload {
        namespace: "default".into(),
        name: name.into(),
        uid: format!("uid-{name}"),
        labels: HashMap::new(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        containers: vec![ContainerSpec {
            name: "app".into(),
            image: "nginx:1.27".into(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            ports: Vec::new(),
            requests: ResourceRequests::default(),
        }],
        restart_policy: Default::default(),
    }
}

/// Workload pinned to `device_id` requesting the given resources.
pub fn workload_on(
    name: &str,
    device_id: &str,
    cpu_millis: u64,
    memory_bytes: u64,
) -> Workload {
    let mut w = workload(name, &[(DEVICE_ANNOTATION, device_id)]);
    w.containers[0].requests = ResourceRequests {
        cpu_millis,
        memory_bytes,
    };
    w
}

pub fn state_with(backend: &Arc<FakeBackend>) -> SharedState {
    SharedState::new(base_config(), backend.clone())
}

/// In-memory backend. The device status block is owned by the "device", so
/// updates keep the stored status and only replace metadata and spec.
#[derive(Default)]
pub struct FakeBackend {
    devices: StdMutex<BTreeMap<String, DeviceDocument>>,
    fleets: StdMutex<BTreeMap<String, FleetDocument>>,
    unreachable: AtomicBool,
    unreachable_devices: StdMutex<HashSet<String>>,
    update_delay: StdMutex<Option<Duration>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl FakeBackend {
    pub fn put_device(&self, doc: DeviceDocument) {
        self.devices
            .lock()
            .expect("devices lock")
            .insert(doc.metadata.name.clone(), doc);
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.lock().expect("devices lock").remove(id);
    }

    pub fn device(&self, id: &str) -> Option<DeviceDocument> {
        self.devices.lock().expect("devices lock").get(id).cloned()
    }

    /// Overwrites the device-reported summary, as the device agent would.
    pub fn set_summary(&self, id: &str, summary: &str) {
        let mut devices = self.devices.lock().expect("devices lock");
        if let Some(doc) = devices.get_mut(id) {
            doc.status.get_or_insert_with(Default::default).summary = Some(StatusSummary {
                status: summary.into(),
                info: None,
            });
        }
    }

    /// Reports a runtime status for `app` on device `id`.
    pub fn report_app(&self, id: &str, app: &str, status: &str) {
        let mut devices = self.devices.lock().expect("devices lock");
        if let Some(doc) = devices.get_mut(id) {
            let status_block = doc.status.get_or_insert_with(Default::default);
            status_block.applications.retain(|entry| entry.name != app);
            status_block.applications.push(ApplicationStatus {
                name: app.into(),
                status: status.into(),
                summary: None,
            });
        }
    }

    pub fn declared_apps(&self, id: &str) -> Vec<String> {
        self.device(id)
            .map(|doc| {
                doc.spec
                    .applications
                    .into_iter()
                    .map(|app| app.name)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn put_fleet(&self, id: &str, total: i64) {
        let fleet = FleetDocument {
            metadata: ObjectMeta {
                name: id.into(),
                ..Default::default()
            },
            status: Some(FleetStatus {
                devices_summary: Some(DevicesSummary { total }),
            }),
        };
        self.fleets
            .lock()
            .expect("fleets lock")
            .insert(id.into(), fleet);
    }

    pub fn fail_all(&self, fail: bool) {
        self.unreachable.store(fail, Ordering::SeqCst);
    }

    pub fn fail_device(&self, id: &str, fail: bool) {
        let mut failing = self.unreachable_devices.lock().expect("failing lock");
        if fail {
            failing.insert(id.to_string());
        } else {
            failing.remove(id);
        }
    }

    pub fn delay_updates(&self, delay: Duration) {
        *self.update_delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str, device_id: Option<&str>) -> Result<(), BackendError> {
        let device_down = device_id.is_some_and(|id| {
            self.unreachable_devices
                .lock()
                .expect("failing lock")
                .contains(id)
        });
        if self.unreachable.load(Ordering::SeqCst) || device_down {
            return Err(BackendError::Unreachable {
                operation: operation.to_string(),
                source: anyhow::anyhow!("connection refused"),
            });
        }
        Ok(())
    }

    fn not_found(operation: &str, id: &str) -> BackendError {
        BackendError::Rejected {
            operation: operation.to_string(),
            status: reqwest::StatusCode::NOT_FOUND,
            body: format!("device {id} not found"),
        }
    }
}

#[async_trait]
impl FleetBackend for FakeBackend {
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check("get_device", Some(device_id))?;
        self.device(device_id)
            .ok_or_else(|| Self::not_found("get_device", device_id))
    }

    async fn update_device(
        &self,
        device_id: &str,
        doc: &DeviceDocument,
    ) -> Result<(), BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check("update_device", Some(device_id))?;
        let mut devices = self.devices.lock().expect("devices lock");
        let Some(stored) = devices.get_mut(device_id) else {
            return Err(Self::not_found("update_device", device_id));
        };
        stored.metadata = doc.metadata.clone();
        stored.spec = doc.spec.clone();
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDocument>, BackendError> {
        self.check("list_devices", None)?;
        Ok(self
            .devices
            .lock()
            .expect("devices lock")
            .values()
            .cloned()
            .collect())
    }

    async fn list_fleets(&self) -> Result<Vec<FleetDocument>, BackendError> {
        self.check("list_fleets", None)?;
        Ok(self
            .fleets
            .lock()
            .expect("fleets lock")
            .values()
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check("ping", None)
    }
}

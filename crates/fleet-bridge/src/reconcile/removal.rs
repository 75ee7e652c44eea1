use std::time::Instant;

use tracing::{debug, info};

use crate::{
    error::BridgeError,
    reconcile::{
        audit::{Action, Operation},
        dispatch::{self, Removal},
        finish,
    },
    state::{self, PodDeviceMapping, SharedState},
    workload::WorkloadKey,
};

/// Removes a workload. Deleting something that is not mapped succeeds.
pub async fn delete_workload(state: &SharedState, key: &WorkloadKey) -> Result<(), BridgeError> {
    let started = Instant::now();

    if state.placements().cancel(key) {
        debug!(workload = %key, "cancelled in-flight placement");
    }

    let Some(mapping) = state::mapping(state, key).await else {
        debug!(workload = %key, "delete for unmapped workload");
        return Ok(());
    };

    let result = remove_mapped(state, &mapping).await.map(|_| ());
    finish(state, key, Operation::Delete, Action::Remove, None, started, &result).await;
    if result.is_ok() {
        info!(workload = %key, device_id = %mapping.device_id, "workload removed");
    }
    result
}

/// Removes the mapped application from its device and then the mapping
/// itself, provided it still belongs to the same uid. A device that no longer
/// exists counts as removed.
pub(crate) async fn remove_mapped(
    state: &SharedState,
    mapping: &PodDeviceMapping,
) -> Result<Removal, BridgeError> {
    let removal =
        dispatch::remove_application(state, &mapping.device_id, &mapping.app_name).await?;

    {
        let mut store = state.mappings_write().await;
        if store
            .get(&mapping.key)
            .is_some_and(|current| current.uid == mapping.uid)
        {
            store.remove(&mapping.key);
        }
    }
    state.registry().invalidate_snapshot(&mapping.device_id).await;
    Ok(removal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::placement::create_workload;
    use crate::test_support::{FakeBackend, device_doc, state_with, workload_on};
    use std::sync::Arc;

    fn key() -> WorkloadKey {
        WorkloadKey::new("default", "web")
    }

    #[tokio::test]
    async fn delete_twice_succeeds() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        create_workload(&state, workload_on("web", "dev-1", 500, 0))
            .await
            .expect("placed");

        delete_workload(&state, &key()).await.expect("first delete");
        delete_workload(&state, &key()).await.expect("second delete");
        assert!(state.mappings_read().await.is_empty());
        assert!(backend.declared_apps("dev-1").is_empty());
    }

    #[tokio::test]
    async fn delete_tolerates_a_vanished_device() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        create_workload(&state, workload_on("web", "dev-1", 500, 0))
            .await
            .expect("placed");

        backend.remove_device("dev-1");
        delete_workload(&state, &key()).await.expect("delete");
        assert!(state.mappings_read().await.is_empty());
    }

    #[tokio::test]
    async fn backend_outage_keeps_the_mapping() {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        let state = state_with(&backend);
        create_workload(&state, workload_on("web", "dev-1", 500, 0))
            .await
            .expect("placed");

        backend.fail_all(true);
        let err = delete_workload(&state, &key()).await.expect_err("outage");
        assert!(err.is_retryable());
        assert!(state::mapping(&state, &key()).await.is_some());
    }
}

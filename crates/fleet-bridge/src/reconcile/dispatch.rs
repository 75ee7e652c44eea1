//! Read-modify-write of a device's application list.

use common::api::Application;
use tracing::{debug, info};

use crate::backend::{BackendError, bounded};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The application was not declared on the device.
    Absent,
    /// The device itself no longer exists at the backend.
    DeviceGone,
}

/// Declares `app` on `device_id`, replacing an entry of the same name.
pub async fn deploy_application(
    state: &SharedState,
    device_id: &str,
    app: Application,
) -> Result<(), BackendError> {
    let timeout = state.cfg().request_timeout();
    let backend = state.backend();
    let lock = state.device_write_lock(device_id);
    let _write = lock.lock().await;

    let mut doc = bounded("get_device", timeout, backend.get_device(device_id)).await?;
    let app_name = app.name.clone();
    match doc
        .spec
        .applications
        .iter_mut()
        .find(|existing| existing.name == app.name)
    {
        Some(existing) => *existing = app,
        None => doc.spec.applications.push(app),
    }
    // Status is owned by the device agent.
    doc.status = None;

    bounded(
        "update_device",
        timeout,
        backend.update_device(device_id, &doc),
    )
    .await?;
    info!(%device_id, app = %app_name, "application declared on device");
    Ok(())
}

/// Drops `app_name` from `device_id`. Absence is not an error and skips the
/// update call.
pub async fn remove_application(
    state: &SharedState,
    device_id: &str,
    app_name: &str,
) -> Result<Removal, BackendError> {
    let timeout = state.cfg().request_timeout();
    let backend = state.backend();
    let lock = state.device_write_lock(device_id);
    let _write = lock.lock().await;

    let mut doc = match bounded("get_device", timeout, backend.get_device(device_id)).await {
        Ok(doc) => doc,
        Err(err) if err.is_not_found() => {
            debug!(%device_id, app = %app_name, "device gone; nothing to remove");
            return Ok(Removal::DeviceGone);
        }
        Err(err) => return Err(err),
    };

    let before = doc.spec.applications.len();
    doc.spec.applications.retain(|app| app.name != app_name);
    if doc.spec.applications.len() == before {
        debug!(%device_id, app = %app_name, "application already absent");
        return Ok(Removal::Absent);
    }
    doc.status = None;

    bounded(
        "update_device",
        timeout,
        backend.update_device(device_id, &doc),
    )
    .await?;
    info!(%device_id, app = %app_name, "application removed from device");
    Ok(Removal::Removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeBackend, base_config, device_doc};
    use common::api::InlineContent;
    use std::sync::Arc;

    fn app(name: &str, content: &str) -> Application {
        Application {
            name: name.into(),
            app_type: "compose".into(),
            inline: vec![InlineContent {
                path: "podman-compose.yaml".into(),
                content: content.into(),
            }],
        }
    }

    fn setup() -> (SharedState, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        backend.put_device(device_doc("dev-1", "Online", "4", "8Gi"));
        (SharedState::new(base_config(), backend.clone()), backend)
    }

    #[tokio::test]
    async fn deploy_appends_then_replaces_by_name() {
        let (state, backend) = setup();
        deploy_application(&state, "dev-1", app("default-web", "v1"))
            .await
            .expect("deploy");
        deploy_application(&state, "dev-1", app("default-web", "v2"))
            .await
            .expect("redeploy");

        let doc = backend.device("dev-1").expect("device");
        assert_eq!(doc.spec.applications.len(), 1);
        assert_eq!(doc.spec.applications[0].inline[0].content, "v2");
        assert_eq!(backend.put_calls(), 2);
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_skips_needless_updates() {
        let (state, backend) = setup();
        deploy_application(&state, "dev-1", app("default-web", "v1"))
            .await
            .expect("deploy");

        let first = remove_application(&state, "dev-1", "default-web")
            .await
            .expect("remove");
        let second = remove_application(&state, "dev-1", "default-web")
            .await
            .expect("remove again");
        assert_eq!(first, Removal::Removed);
        assert_eq!(second, Removal::Absent);
        assert_eq!(backend.put_calls(), 2);

        let gone = remove_application(&state, "dev-404", "default-web")
            .await
            .expect("missing device tolerated");
        assert_eq!(gone, Removal::DeviceGone);
    }

    #[tokio::test]
    async fn backend_failure_is_propagated() {
        let (state, backend) = setup();
        backend.fail_all(true);
        let err = deploy_application(&state, "dev-1", app("default-web", "v1"))
            .await
            .expect_err("backend down");
        assert!(!err.is_rejection());
    }

    #[tokio::test]
    async fn concurrent_deploys_to_one_device_keep_every_app() {
        let (state, backend) = setup();
        backend.delay_updates(std::time::Duration::from_millis(20));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..4 {
            let state = state.clone();
            set.spawn(async move {
                deploy_application(&state, "dev-1", app(&format!("default-web-{i}"), "v1")).await
            });
        }
        while let Some(res) = set.join_next().await {
            res.expect("task").expect("deploy");
        }

        let doc = backend.device("dev-1").expect("device");
        assert_eq!(doc.spec.applications.len(), 4);
    }
}

//! Access to the fleet-management backend.

use std::sync::Arc;

use async_trait::async_trait;
use common::api::{DeviceDocument, FleetDocument};
use reqwest::StatusCode;
use thiserror::Error;

mod client;
mod token;

pub use client::BackendClient;
pub use token::TokenManager;

pub type DynFleetBackend = Arc<dyn FleetBackend>;

/// Failures of a single backend call. Nothing at this layer retries.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable during {operation}: {source}")]
    Unreachable {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("backend rejected {operation}: status {status}, body: {body}")]
    Rejected {
        operation: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode backend response for {operation}: {source}")]
    Decode {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("token endpoint returned an empty access token")]
    EmptyToken,
}

impl BackendError {
    /// The backend answered but refused or garbled the request.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BackendError::Unreachable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::Rejected { status, .. } if *status == StatusCode::NOT_FOUND
        )
    }

    pub(crate) fn timed_out(operation: impl Into<String>, after: std::time::Duration) -> Self {
        BackendError::Unreachable {
            operation: operation.into(),
            source: anyhow::anyhow!("no response within {}ms", after.as_millis()),
        }
    }
}

/// Typed operations the bridge needs from the backend.
#[async_trait]
pub trait FleetBackend: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument, BackendError>;

    /// Full-document replace of a device.
    async fn update_device(
        &self,
        device_id: &str,
        device: &DeviceDocument,
    ) -> Result<(), BackendError>;

    async fn list_devices(&self) -> Result<Vec<DeviceDocument>, BackendError>;

    async fn list_fleets(&self) -> Result<Vec<FleetDocument>, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// Bounds `fut` by `limit`, mapping expiry to [`BackendError::Unreachable`].
pub(crate) async fn bounded<T, F>(
    operation: &str,
    limit: std::time::Duration,
    fut: F,
) -> Result<T, BackendError>
where
    F: std::future::Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::timed_out(operation, limit)),
    }
}

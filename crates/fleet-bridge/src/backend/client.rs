use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use common::api::{DeviceDocument, DeviceList, FleetDocument, FleetList};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendError, FleetBackend, TokenManager};
use crate::{REQUEST_ID_HEADER, telemetry};

/// HTTP client for the fleet backend REST API.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<TokenManager>,
}

impl BackendClient {
    pub fn new(base_url: &str, client: reqwest::Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Executes one authenticated request. Non-2xx answers become
    /// [`BackendError::Rejected`] carrying the status and body; nothing is
    /// retried here.
    pub async fn request<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, BackendError>
    where
        B: Serialize + ?Sized,
    {
        let operation = format!("{method} {path}");
        let token = self.tokens.token().await?;
        let request_id = Uuid::new_v4().to_string();

        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header(REQUEST_ID_HEADER, &request_id);
        if let Some(body) = body {
            request = request.json(body);
        }

        let res = match request.send().await {
            Ok(res) => res,
            Err(err) => {
                telemetry::record_backend_request(method.as_str(), "unreachable");
                warn!(%request_id, %operation, ?err, "backend request failed");
                return Err(BackendError::Unreachable {
                    operation,
                    source: err.into(),
                });
            }
        };

        let status = res.status();
        if !status.is_success() {
            telemetry::record_backend_request(method.as_str(), "rejected");
            if status == StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
            }
            let body = res.text().await.unwrap_or_default();
            debug!(%request_id, %operation, %status, "backend rejected request");
            return Err(BackendError::Rejected {
                operation,
                status,
                body,
            });
        }

        telemetry::record_backend_request(method.as_str(), "success");
        Ok(res)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let res = self.request::<()>(Method::GET, path, None).await?;
        res.json::<T>().await.map_err(|err| BackendError::Decode {
            operation: format!("GET {path}"),
            source: anyhow!(err),
        })
    }
}

fn device_path(device_id: &str) -> String {
    format!("/api/v1/devices/{device_id}")
}

const DEVICES_PATH: &str = "/api/v1/devices";
const FLEETS_PATH: &str = "/api/v1/fleets";

#[async_trait]
impl FleetBackend for BackendClient {
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument, BackendError> {
        self.get_json(&device_path(device_id)).await
    }

    async fn update_device(
        &self,
        device_id: &str,
        device: &DeviceDocument,
    ) -> Result<(), BackendError> {
        let path = device_path(device_id);
        let res = self.request(Method::PUT, &path, Some(device)).await?;
        match res.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(BackendError::Rejected {
                operation: format!("PUT {path}"),
                status,
                body: res.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDocument>, BackendError> {
        let list: DeviceList = self.get_json(DEVICES_PATH).await?;
        Ok(list.items)
    }

    async fn list_fleets(&self) -> Result<Vec<FleetDocument>, BackendError> {
        let list: FleetList = self.get_json(FLEETS_PATH).await?;
        Ok(list.items)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.request::<()>(Method::GET, FLEETS_PATH, None)
            .await
            .map(|_| ())
    }
}

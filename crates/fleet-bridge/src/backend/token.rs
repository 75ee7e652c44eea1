use std::time::Duration;

use anyhow::anyhow;
use common::api::TokenResponse;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::BackendError;
use crate::telemetry;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    valid_until: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.valid_until
    }
}

/// OAuth2 client-credentials token cache.
///
/// Callers share one cached token; when it expires exactly one of them
/// fetches a replacement while the rest wait on the write lock and reuse it.
pub struct TokenManager {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    margin: Duration,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        margin: Duration,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            margin,
            cached: RwLock::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, BackendError> {
        {
            let guard = self.cached.read().await;
            if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut guard = self.cached.write().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        match self.fetch().await {
            Ok(fresh) => {
                telemetry::record_token_refresh("success");
                let value = fresh.value.clone();
                *guard = Some(fresh);
                Ok(value)
            }
            Err(err) => {
                telemetry::record_token_refresh("error");
                warn!(token_url = %self.token_url, error = %err, "token refresh failed");
                Err(err)
            }
        }
    }

    /// Drops the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn fetch(&self) -> Result<CachedToken, BackendError> {
        let operation = "token request";
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let res = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| BackendError::Unreachable {
                operation: operation.into(),
                source: err.into(),
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                operation: operation.into(),
                status,
                body,
            });
        }

        let body = res
            .json::<TokenResponse>()
            .await
            .map_err(|err| BackendError::Decode {
                operation: operation.into(),
                source: anyhow!(err),
            })?;
        if body.access_token.is_empty() {
            return Err(BackendError::EmptyToken);
        }

        let lifetime = Duration::from_secs(body.expires_in);
        let usable = if lifetime > self.margin {
            lifetime - self.margin
        } else {
            lifetime
        };
        debug!(
            expires_in = body.expires_in,
            usable_secs = usable.as_secs(),
            "fetched access token"
        );

        Ok(CachedToken {
            value: body.access_token,
            valid_until: Instant::now() + usable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use std::sync::Arc;

    fn manager(server: &MockServer, margin: Duration) -> TokenManager {
        TokenManager::new(
            reqwest::Client::new(),
            server.url("/token"),
            "bridge",
            "s3cret",
            margin,
        )
    }

    #[tokio::test]
    async fn fetches_with_client_credentials_and_caches() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body_contains("grant_type=client_credentials")
                    .body_contains("client_id=bridge")
                    .body_contains("client_secret=s3cret");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "abc",
                    "token_type": "Bearer",
                    "expires_in": 300
                }));
            })
            .await;

        let tokens = manager(&server, Duration::from_secs(60));
        assert_eq!(tokens.token().await.expect("token"), "abc");
        assert_eq!(tokens.token().await.expect("cached token"), "abc");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .delay(Duration::from_millis(50))
                    .json_body(serde_json::json!({ "access_token": "shared", "expires_in": 600 }));
            })
            .await;

        let tokens = Arc::new(manager(&server, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tokens = tokens.clone();
            handles.push(tokio::spawn(async move { tokens.token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("token"), "shared");
        }
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn token_inside_margin_is_refetched() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({ "access_token": "short", "expires_in": 0 }));
            })
            .await;

        let tokens = manager(&server, Duration::from_secs(60));
        tokens.token().await.expect("first");
        tokens.token().await.expect("second");
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn rejected_and_empty_tokens_are_errors() {
        let server = MockServer::start_async().await;
        let mut denied = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(401).body("invalid_client");
            })
            .await;

        let tokens = manager(&server, Duration::from_secs(60));
        let err = tokens.token().await.expect_err("rejected");
        assert!(matches!(
            err,
            BackendError::Rejected { status, ref body, .. }
                if status == reqwest::StatusCode::UNAUTHORIZED && body == "invalid_client"
        ));
        denied.delete_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({ "access_token": "", "expires_in": 600 }));
            })
            .await;
        let err = tokens.token().await.expect_err("empty");
        assert!(matches!(err, BackendError::EmptyToken));
    }
}

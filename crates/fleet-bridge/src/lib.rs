use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::warn;

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod node;
pub mod provider;
pub mod quantity;
pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod selector;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod translator;
pub mod version;
pub mod workload;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use error::{BridgeError, PlacementError};
pub use provider::{FleetBridge, NodeProvider, WorkloadLifecycle};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const BRIDGE_VERSION_HEADER: &str = "x-fleet-bridge-version";
pub const BRIDGE_BUILD_HEADER: &str = "x-fleet-bridge-build";

/// Checks the scheme of every outbound endpoint.
pub fn validate_backend_urls(cfg: &config::AppConfig) -> anyhow::Result<()> {
    validate_url("backend_url", &cfg.backend_url, cfg.allow_insecure_http)?;
    validate_url("token_url", &cfg.token_url, cfg.allow_insecure_http)
}

fn validate_url(name: &str, raw: &str, allow_insecure_http: bool) -> anyhow::Result<()> {
    let url = reqwest::Url::parse(raw).with_context(|| format!("invalid {name}: {raw}"))?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if allow_insecure_http => {
            warn!(%name, url = %raw, "insecure HTTP endpoint in use; traffic will be unencrypted");
            Ok(())
        }
        "http" => anyhow::bail!(
            "insecure {name} not allowed: {raw}; set allow_insecure_http=true to override"
        ),
        other => anyhow::bail!("unsupported URL scheme for {name}: {other}"),
    }
}

pub fn build_client(cfg: &config::AppConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(build_bridge_headers()?)
        .timeout(cfg.request_timeout());

    if let Some(ca_path) = cfg.ca_cert_path.as_ref() {
        let pem = std::fs::read(ca_path)
            .map_err(|err| anyhow::anyhow!("failed to read ca_cert_path {}: {}", ca_path, err))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|err| anyhow::anyhow!("invalid certificate in {}: {}", ca_path, err))?;
        builder = builder.add_root_certificate(cert);
    }

    if cfg.tls_insecure_skip_verify {
        warn!("TLS certificate verification is disabled; use only for development");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(Into::into)
}

fn build_bridge_headers() -> anyhow::Result<HeaderMap> {
    if version::VERSION.trim().is_empty() {
        anyhow::bail!("bridge version metadata missing; refusing to start");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        BRIDGE_VERSION_HEADER,
        HeaderValue::from_str(version::VERSION).context("invalid bridge version header value")?,
    );
    headers.insert(
        BRIDGE_BUILD_HEADER,
        HeaderValue::from_str(version::GIT_SHA).context("invalid bridge build header value")?,
    );
    Ok(headers)
}

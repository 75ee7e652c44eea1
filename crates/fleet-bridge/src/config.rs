use config::builder::DefaultState;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::models::ResourceList;
use crate::registry::RegistrySettings;

pub const ENV_PREFIX: &str = "FLEET_BRIDGE";

pub const MIN_POLL_INTERVAL_SECS: u64 = 15;
pub const MAX_POLL_INTERVAL_SECS: u64 = 30;
pub const MIN_RECONNECT_TIMEOUT_SECS: u64 = 60;
pub const MAX_RECONNECT_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Name of the virtual node presented to the orchestrator.
    pub node_name: String,
    pub backend_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub allow_insecure_http: bool,
    pub tls_insecure_skip_verify: bool,
    pub ca_cert_path: Option<String>,
    pub request_timeout_secs: u64,
    pub token_expiry_margin_secs: u64,
    pub status_poll_interval_secs: u64,
    pub full_resync_interval_secs: u64,
    pub device_refresh_interval_secs: u64,
    pub snapshot_ttl_secs: u64,
    /// How long mapped workloads survive a disconnected device.
    pub reconnect_timeout_secs: u64,
    /// Consecutive failed polls before a device is treated as disconnected.
    pub poll_failure_threshold: u32,
    /// How long a device missing from backend listings stays known.
    pub device_grace_period_secs: u64,
    /// Device used for workloads without placement annotations. No built-in
    /// default.
    pub default_device_id: Option<String>,
    pub system_reserved_cpu_millis: u64,
    pub system_reserved_memory_bytes: u64,
    pub capacity_noise_cpu_millis: u64,
    pub capacity_noise_memory_bytes: u64,
    #[serde(default)]
    pub node_labels: HashMap<String, String>,
    pub metrics_host: String,
    pub metrics_port: u16,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("node_name cannot be empty");
        }
        for (key, value) in [
            ("backend_url", &self.backend_url),
            ("token_url", &self.token_url),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{key} is required (set {ENV_PREFIX}_{})", key.to_uppercase());
            }
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be > 0");
        }
        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS)
            .contains(&self.status_poll_interval_secs)
        {
            anyhow::bail!(
                "status_poll_interval_secs must be between {MIN_POLL_INTERVAL_SECS} and {MAX_POLL_INTERVAL_SECS} (got {})",
                self.status_poll_interval_secs
            );
        }
        if self.full_resync_interval_secs < self.status_poll_interval_secs {
            anyhow::bail!("full_resync_interval_secs must be >= status_poll_interval_secs");
        }
        if self.device_refresh_interval_secs == 0 {
            anyhow::bail!("device_refresh_interval_secs must be > 0");
        }
        if self.snapshot_ttl_secs == 0 {
            anyhow::bail!("snapshot_ttl_secs must be > 0");
        }
        validate_reconnect_timeout(self.reconnect_timeout())?;
        if self.poll_failure_threshold == 0 {
            anyhow::bail!("poll_failure_threshold must be > 0");
        }
        if self
            .default_device_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            anyhow::bail!("default_device_id cannot be blank when set");
        }
        if self.metrics_port == 0 {
            anyhow::bail!("metrics_port must be > 0");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_expiry_margin(&self) -> Duration {
        Duration::from_secs(self.token_expiry_margin_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn full_resync_interval(&self) -> Duration {
        Duration::from_secs(self.full_resync_interval_secs)
    }

    pub fn device_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.device_refresh_interval_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn system_reserved(&self) -> ResourceList {
        ResourceList::new(
            self.system_reserved_cpu_millis,
            self.system_reserved_memory_bytes,
        )
    }

    pub fn capacity_noise(&self) -> ResourceList {
        ResourceList::new(
            self.capacity_noise_cpu_millis,
            self.capacity_noise_memory_bytes,
        )
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            snapshot_ttl: Duration::from_secs(self.snapshot_ttl_secs),
            grace_period: Duration::from_secs(self.device_grace_period_secs),
            system_reserved: self.system_reserved(),
            request_timeout: self.request_timeout(),
        }
    }
}

/// Reconnection timeouts are hard-bounded to 1..=30 minutes.
pub fn validate_reconnect_timeout(timeout: Duration) -> anyhow::Result<()> {
    let secs = timeout.as_secs();
    if !(MIN_RECONNECT_TIMEOUT_SECS..=MAX_RECONNECT_TIMEOUT_SECS).contains(&secs) {
        anyhow::bail!(
            "reconnect timeout must be between {MIN_RECONNECT_TIMEOUT_SECS}s and {MAX_RECONNECT_TIMEOUT_SECS}s (got {secs}s)"
        );
    }
    Ok(())
}

enum EnvKind {
    String,
    Labels,
}

// (ENV_NAME, config_key, kind)
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("FLEET_BRIDGE_NODE_NAME", "node_name", EnvKind::String),
    ("FLEET_BRIDGE_BACKEND_URL", "backend_url", EnvKind::String),
    ("FLEET_BRIDGE_TOKEN_URL", "token_url", EnvKind::String),
    ("FLEET_BRIDGE_CLIENT_ID", "client_id", EnvKind::String),
    ("FLEET_BRIDGE_CLIENT_SECRET", "client_secret", EnvKind::String),
    (
        "FLEET_BRIDGE_ALLOW_INSECURE_HTTP",
        "allow_insecure_http",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_TLS_INSECURE_SKIP_VERIFY",
        "tls_insecure_skip_verify",
        EnvKind::String,
    ),
    ("FLEET_BRIDGE_CA_CERT_PATH", "ca_cert_path", EnvKind::String),
    (
        "FLEET_BRIDGE_REQUEST_TIMEOUT_SECS",
        "request_timeout_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_TOKEN_EXPIRY_MARGIN_SECS",
        "token_expiry_margin_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_STATUS_POLL_INTERVAL_SECS",
        "status_poll_interval_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_FULL_RESYNC_INTERVAL_SECS",
        "full_resync_interval_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_DEVICE_REFRESH_INTERVAL_SECS",
        "device_refresh_interval_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_SNAPSHOT_TTL_SECS",
        "snapshot_ttl_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_RECONNECT_TIMEOUT_SECS",
        "reconnect_timeout_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_POLL_FAILURE_THRESHOLD",
        "poll_failure_threshold",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_DEVICE_GRACE_PERIOD_SECS",
        "device_grace_period_secs",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_DEFAULT_DEVICE_ID",
        "default_device_id",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_SYSTEM_RESERVED_CPU_MILLIS",
        "system_reserved_cpu_millis",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_SYSTEM_RESERVED_MEMORY_BYTES",
        "system_reserved_memory_bytes",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_CAPACITY_NOISE_CPU_MILLIS",
        "capacity_noise_cpu_millis",
        EnvKind::String,
    ),
    (
        "FLEET_BRIDGE_CAPACITY_NOISE_MEMORY_BYTES",
        "capacity_noise_memory_bytes",
        EnvKind::String,
    ),
    ("FLEET_BRIDGE_NODE_LABELS", "node_labels", EnvKind::Labels),
    ("FLEET_BRIDGE_METRICS_HOST", "metrics_host", EnvKind::String),
    ("FLEET_BRIDGE_METRICS_PORT", "metrics_port", EnvKind::String),
];

fn parse_labels(value: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for entry in value.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((k, v)) = trimmed.split_once('=') {
            labels.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    labels
}

fn defaults() -> anyhow::Result<config::ConfigBuilder<DefaultState>> {
    Ok(config::Config::builder()
        .set_default("node_name", "fleet-bridge")?
        .set_default("backend_url", "")?
        .set_default("token_url", "")?
        .set_default("client_id", "")?
        .set_default("client_secret", "")?
        .set_default("allow_insecure_http", false)?
        .set_default("tls_insecure_skip_verify", false)?
        .set_default("ca_cert_path", Option::<String>::None)?
        .set_default("request_timeout_secs", 30)?
        .set_default("token_expiry_margin_secs", 60)?
        .set_default("status_poll_interval_secs", 15)?
        .set_default("full_resync_interval_secs", 300)?
        .set_default("device_refresh_interval_secs", 300)?
        .set_default("snapshot_ttl_secs", 30)?
        .set_default("reconnect_timeout_secs", 300)?
        .set_default("poll_failure_threshold", 3)?
        .set_default("device_grace_period_secs", 900)?
        .set_default("default_device_id", Option::<String>::None)?
        .set_default("system_reserved_cpu_millis", 0)?
        .set_default("system_reserved_memory_bytes", 0)?
        .set_default("capacity_noise_cpu_millis", 100)?
        .set_default("capacity_noise_memory_bytes", 64 * 1024 * 1024)?
        .set_default("node_labels", HashMap::<String, String>::new())?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9092)?)
}

fn apply_env_overrides<F>(
    mut builder: config::ConfigBuilder<DefaultState>,
    lookup: F,
) -> anyhow::Result<config::ConfigBuilder<DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    for (env_key, cfg_key, kind) in ENV_OVERRIDES {
        if let Some(value) = lookup(env_key) {
            builder = match kind {
                EnvKind::Labels => builder.set_override(*cfg_key, parse_labels(&value))?,
                EnvKind::String => builder.set_override(*cfg_key, value)?,
            };
        }
    }
    Ok(builder)
}

fn finish(builder: config::ConfigBuilder<DefaultState>) -> anyhow::Result<AppConfig> {
    let mut app: AppConfig = builder.build()?.try_deserialize()?;
    app.backend_url = app.backend_url.trim().to_string();
    app.token_url = app.token_url.trim().to_string();
    app.default_device_id = app
        .default_device_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    app.validate()?;
    Ok(app)
}

/// Loads `config.{toml,yaml,json}` from the working directory (optional),
/// then `FLEET_BRIDGE_*` environment overrides.
pub fn load() -> anyhow::Result<AppConfig> {
    let builder = defaults()?.add_source(config::File::with_name("config").required(false));
    finish(apply_env_overrides(builder, |key| env::var(key).ok())?)
}

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::tuya::{DeviceEndpoint, ProtocolVersion};

pub const DEFAULT_DEVICE_PORT: u16 = 6668;
const DEFAULT_SETUP_CONFIG_PATH: &str = "config.json";

/// Location of the file written by the interactive device setup wizard.
fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("AQUAMON_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// Fields the setup wizard resolves out-of-band. Env vars win over the file.
#[derive(Debug, Clone, Deserialize)]
struct SetupOverrides {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    device_ip: Option<String>,
    #[serde(default)]
    local_key: Option<String>,
    // The wizard historically wrote this as a bare number (3.5), newer
    // versions write a string.
    #[serde(default)]
    protocol_version: Option<serde_json::Value>,
}

fn load_setup_overrides() -> Option<SetupOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env values only"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(overrides) => Some(overrides),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env values only"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub device_id: String,
    pub device_host: String,
    pub device_port: u16,
    pub local_key: Vec<u8>,
    pub protocol_version: ProtocolVersion,
    pub victoria_url: String,
    pub sensor_label: String,
    pub http_bind: String,

    pub poll_interval_seconds: u64,
    pub startup_jitter_seconds: u64,
    pub device_timeout_seconds: u64,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    pub max_transient_retries: u32,
    pub disconnect_after_failures: u32,
    pub sink_retries: u32,
    pub sink_backoff_ms: u64,
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_overrides();

        let device_id = env_optional("AQUAMON_DEVICE_ID")
            .or_else(|| override_string(overrides.as_ref().and_then(|o| o.device_id.as_deref())))
            .context("AQUAMON_DEVICE_ID is required (or device_id in the setup config)")?;
        let device_host = env_optional("AQUAMON_DEVICE_HOST")
            .or_else(|| override_string(overrides.as_ref().and_then(|o| o.device_ip.as_deref())))
            .context("AQUAMON_DEVICE_HOST is required (or device_ip in the setup config)")?;
        let device_port = env_u64("AQUAMON_DEVICE_PORT", Some(DEFAULT_DEVICE_PORT as u64))? as u16;

        let local_key_raw = env_optional("AQUAMON_LOCAL_KEY")
            .or_else(|| override_string(overrides.as_ref().and_then(|o| o.local_key.as_deref())))
            .context("AQUAMON_LOCAL_KEY is required (or local_key in the setup config)")?;
        let local_key = parse_local_key(&local_key_raw)?;

        let version_raw = env_optional("AQUAMON_PROTOCOL_VERSION")
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|o| o.protocol_version.as_ref())
                    .and_then(version_string)
            })
            .unwrap_or_else(|| "3.5".to_string());
        let protocol_version = ProtocolVersion::parse(&version_raw).ok_or_else(|| {
            anyhow!("unsupported protocol version {version_raw:?}; expected 3.3 or 3.5")
        })?;

        let victoria_url = env_string("AQUAMON_VM_URL", Some("http://127.0.0.1:8428".to_string()))?;
        Url::parse(&victoria_url).context("invalid AQUAMON_VM_URL")?;

        let sensor_label = env_string("AQUAMON_SENSOR_LABEL", Some("seafront_8in1".to_string()))?;
        let http_bind = env_string("AQUAMON_HTTP_BIND", Some("127.0.0.1:9090".to_string()))?;

        Ok(Self {
            device_id,
            device_host,
            device_port,
            local_key,
            protocol_version,
            victoria_url,
            sensor_label,
            http_bind,
            poll_interval_seconds: env_u64("AQUAMON_POLL_INTERVAL_SECONDS", Some(300))?,
            startup_jitter_seconds: env_u64("AQUAMON_STARTUP_JITTER_SECONDS", Some(10))?,
            device_timeout_seconds: env_u64("AQUAMON_DEVICE_TIMEOUT_SECONDS", Some(10))?,
            backoff_base_seconds: env_u64("AQUAMON_BACKOFF_BASE_SECONDS", Some(5))?,
            backoff_cap_seconds: env_u64("AQUAMON_BACKOFF_CAP_SECONDS", Some(60))?,
            max_transient_retries: env_u64("AQUAMON_MAX_TRANSIENT_RETRIES", Some(4))? as u32,
            disconnect_after_failures: env_u64("AQUAMON_DISCONNECT_AFTER_FAILURES", Some(3))?
                as u32,
            sink_retries: env_u64("AQUAMON_SINK_RETRIES", Some(3))? as u32,
            sink_backoff_ms: env_u64("AQUAMON_SINK_BACKOFF_MS", Some(500))?,
        })
    }

    pub fn device_endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            device_id: self.device_id.clone(),
            host: self.device_host.clone(),
            port: self.device_port,
            local_key: self.local_key.clone(),
            version: self.protocol_version,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn startup_jitter_max(&self) -> Duration {
        Duration::from_secs(self.startup_jitter_seconds)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_seconds)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub victoria_url: String,
    pub current_staleness_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let victoria_url = env_string("AQUAMON_VM_URL", Some("http://127.0.0.1:8428".to_string()))?;
        Url::parse(&victoria_url).context("invalid AQUAMON_VM_URL")?;
        Ok(Self {
            victoria_url,
            current_staleness_secs: env_u64("AQUAMON_CURRENT_STALENESS_SECONDS", Some(900))?,
        })
    }

    pub fn current_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.current_staleness_secs as i64)
    }
}

/// The shared secret doubles as the AES-128 key and must be exactly 16
/// bytes.
fn parse_local_key(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() != 16 {
        anyhow::bail!(
            "local key must be exactly 16 characters, got {}",
            trimmed.len()
        );
    }
    Ok(trimmed.as_bytes().to_vec())
}

fn version_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(raw) => Some(raw.trim().to_string()),
        serde_json::Value::Number(num) => num.as_f64().map(|v| format!("{v:.1}")),
        _ => None,
    }
}

fn override_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

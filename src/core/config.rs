use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the device connectivity runtime.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// MQTT client identifier presented on connect.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Period of the connectivity tick loop.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            tick_ms: default_tick_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Disable to run the local reporter without any broker traffic.
    #[serde(default = "default_broker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Device access token, sent as the MQTT username. Usually injected via `CUBO_ACCESS_TOKEN`.
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_resolve_refresh_ms")]
    pub resolve_refresh_ms: u64,
    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,
    #[serde(default = "default_attribute_retry_ms")]
    pub attribute_retry_ms: u64,
    #[serde(default = "default_publish_error_window_ms")]
    pub publish_error_window_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_broker_enabled(),
            host: default_broker_host(),
            port: default_broker_port(),
            access_token: String::new(),
            keep_alive_seconds: default_keep_alive_seconds(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            resolve_refresh_ms: default_resolve_refresh_ms(),
            telemetry_topic: default_telemetry_topic(),
            publish_period_ms: default_publish_period_ms(),
            attribute_retry_ms: default_attribute_retry_ms(),
            publish_error_window_ms: default_publish_error_window_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn resolve_refresh(&self) -> Duration {
        Duration::from_millis(self.resolve_refresh_ms)
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_period_ms)
    }

    pub fn attribute_retry(&self) -> Duration {
        Duration::from_millis(self.attribute_retry_ms)
    }

    pub fn publish_error_window(&self) -> Duration {
        Duration::from_millis(self.publish_error_window_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Disable to run without the local event reporter.
    #[serde(default = "default_collector_enabled")]
    pub enabled: bool,
    /// Destination `ip:port` of the local collector.
    #[serde(default = "default_collector_addr")]
    pub addr: String,
    /// Local bind address for the sending socket.
    #[serde(default = "default_collector_bind")]
    pub bind: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: default_collector_enabled(),
            addr: default_collector_addr(),
            bind: default_collector_bind(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via CUBO_CONFIG or defaults to `config/cubo.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate invariants the connectivity core relies on. Collector settings
    /// are checked by the reporter itself, whose failure only disables local
    /// reporting.
    pub fn validate(&self) -> Result<()> {
        if self.device.client_id.is_empty() {
            bail!("device.client_id must be non-empty");
        }
        if self.device.tick_ms == 0 {
            bail!("device.tick_ms must be > 0");
        }
        if self.broker.host.is_empty() {
            bail!("broker.host must be non-empty");
        }
        if self.broker.reconnect_min_ms == 0 {
            bail!("broker.reconnect_min_ms must be > 0");
        }
        if self.broker.reconnect_min_ms > self.broker.reconnect_max_ms {
            bail!(
                "broker.reconnect_min_ms ({}) exceeds broker.reconnect_max_ms ({})",
                self.broker.reconnect_min_ms,
                self.broker.reconnect_max_ms
            );
        }
        if self.broker.publish_period_ms == 0 || self.broker.attribute_retry_ms == 0 {
            bail!("broker publish and attribute periods must be > 0");
        }
        if self.broker.telemetry_topic.is_empty() {
            bail!("broker.telemetry_topic must be non-empty");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("CUBO_ACCESS_TOKEN") {
            self.broker.access_token = token;
        }
        if let Ok(host) = std::env::var("CUBO_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(addr) = std::env::var("CUBO_COLLECTOR_ADDR") {
            self.collector.addr = addr;
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CUBO_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/cubo.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_client_id() -> String {
    "pico_cubo".into()
}

fn default_tick_ms() -> u64 {
    50
}

fn default_broker_enabled() -> bool {
    true
}

fn default_broker_host() -> String {
    "mqtt.thingsboard.cloud".into()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive_seconds() -> u64 {
    30
}

fn default_reconnect_min_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    15_000
}

fn default_resolve_refresh_ms() -> u64 {
    60_000
}

fn default_telemetry_topic() -> String {
    "v1/devices/me/telemetry".into()
}

fn default_publish_period_ms() -> u64 {
    5_000
}

fn default_attribute_retry_ms() -> u64 {
    20_000
}

fn default_publish_error_window_ms() -> u64 {
    2_000
}

fn default_collector_enabled() -> bool {
    true
}

fn default_collector_addr() -> String {
    "192.168.0.10:5000".into()
}

fn default_collector_bind() -> String {
    "0.0.0.0:0".into()
}

fn default_queue_capacity() -> usize {
    24
}

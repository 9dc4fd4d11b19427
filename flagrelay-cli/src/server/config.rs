use std::env;

use serde::Deserialize;

use super::error::ConfigError;

pub const DEFAULT_SDK_URL: &str = "https://sdk.split.io/api";
pub const DEFAULT_EVENTS_URL: &str = "https://events.split.io/api";

/// Top-level relay.toml configuration
#[derive(Debug, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub impressions: ImpressionsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Seconds granted to drain queues on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_sdk_url")]
    pub sdk_url: String,
    #[serde(default = "default_events_url")]
    pub events_url: String,
    /// SSE endpoint for push invalidations. Pull-only when unset.
    pub streaming_url: Option<String>,
    #[serde(default)]
    pub apikey: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_splits_refresh")]
    pub splits_refresh_secs: u64,
    #[serde(default = "default_segments_refresh")]
    pub segments_refresh_secs: u64,
    #[serde(default = "default_telemetry_refresh")]
    pub telemetry_refresh_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionsMode {
    Optimized,
    Debug,
}

impl ImpressionsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImpressionsMode::Optimized => "OPTIMIZED",
            ImpressionsMode::Debug => "DEBUG",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImpressionsConfig {
    #[serde(default = "default_mode")]
    pub mode: ImpressionsMode,
    #[serde(default = "default_post_secs")]
    pub post_secs: u64,
    #[serde(default = "default_counts_post_secs")]
    pub counts_post_secs: u64,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_observer_size")]
    pub observer_size: usize,
    /// When set, a JSON copy of every posted bulk is relayed here.
    pub listener_url: Option<String>,
    #[serde(default = "default_listener_queue_size")]
    pub listener_queue_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_post_secs")]
    pub post_secs: u64,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_timeslice_width")]
    pub timeslice_width_secs: i64,
    #[serde(default = "default_max_timeslices")]
    pub max_timeslices: usize,
}

// ── Default value functions ──────────────────────────

fn default_port() -> u16 {
    3000
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_sdk_url() -> String {
    DEFAULT_SDK_URL.to_string()
}

fn default_events_url() -> String {
    DEFAULT_EVENTS_URL.to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_splits_refresh() -> u64 {
    60
}

fn default_segments_refresh() -> u64 {
    60
}

fn default_telemetry_refresh() -> u64 {
    3600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_mode() -> ImpressionsMode {
    ImpressionsMode::Optimized
}

fn default_post_secs() -> u64 {
    20
}

fn default_counts_post_secs() -> u64 {
    1800
}

fn default_bulk_size() -> usize {
    500
}

fn default_queue_size() -> usize {
    30_000
}

fn default_observer_size() -> usize {
    500_000
}

fn default_listener_queue_size() -> usize {
    1_000
}

fn default_timeslice_width() -> i64 {
    60
}

fn default_max_timeslices() -> usize {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            data_dir: default_data_dir(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            sdk_url: default_sdk_url(),
            events_url: default_events_url(),
            streaming_url: None,
            apikey: String::new(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            splits_refresh_secs: default_splits_refresh(),
            segments_refresh_secs: default_segments_refresh(),
            telemetry_refresh_secs: default_telemetry_refresh(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for ImpressionsConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            post_secs: default_post_secs(),
            counts_post_secs: default_counts_post_secs(),
            bulk_size: default_bulk_size(),
            queue_size: default_queue_size(),
            observer_size: default_observer_size(),
            listener_url: None,
            listener_queue_size: default_listener_queue_size(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            post_secs: default_post_secs(),
            bulk_size: default_bulk_size(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            timeslice_width_secs: default_timeslice_width(),
            max_timeslices: default_max_timeslices(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file. A missing file falls back to
    /// defaults; a file that exists but does not parse is an error.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            }),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SPLITIO_SDK_URL") {
            if !val.is_empty() {
                self.upstream.sdk_url = val;
            }
        }
        if let Ok(val) = env::var("SPLITIO_EVENTS_URL") {
            if !val.is_empty() {
                self.upstream.events_url = val;
            }
        }
        if let Ok(val) = env::var("SPLITIO_STREAMING_URL") {
            if !val.is_empty() {
                self.upstream.streaming_url = Some(val);
            }
        }
        if let Ok(val) = env::var("SPLITIO_APIKEY") {
            if !val.is_empty() {
                self.upstream.apikey = val;
            }
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.apikey.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream apikey is required (set SPLITIO_APIKEY or [upstream] apikey)".to_string(),
            ));
        }
        if self.impressions.bulk_size == 0 || self.events.bulk_size == 0 {
            return Err(ConfigError::Invalid(
                "bulk_size must be greater than zero".to_string(),
            ));
        }
        if self.sync.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_apikey_is_set() {
        let mut config = RelayConfig::default();
        assert!(config.validate().is_err());
        config.upstream.apikey = "server-side-key".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream.sdk_url, DEFAULT_SDK_URL);
        assert_eq!(config.upstream.events_url, DEFAULT_EVENTS_URL);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [server]
            port = 8443

            [impressions]
            mode = "debug"
            bulk_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.impressions.mode, ImpressionsMode::Debug);
        assert_eq!(config.impressions.bulk_size, 50);
        assert_eq!(config.events.bulk_size, default_bulk_size());
    }

    #[test]
    fn zero_bulk_size_is_rejected() {
        let mut config = RelayConfig::default();
        config.upstream.apikey = "k".to_string();
        config.impressions.bulk_size = 0;
        assert!(config.validate().is_err());
    }
}

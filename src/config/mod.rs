//! Configuration management for octrum-core

use crate::transport::{ChannelConfig, ReconnectPolicy};
use crate::webrtc::WhepTimeouts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// WHEP live view
    #[serde(default)]
    pub whep: WhepConfig,

    /// Alert WebSocket channel
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Static login session
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhepConfig {
    /// Stream base URL; `/whep` is appended when missing
    #[serde(default)]
    pub url: Option<String>,

    /// Bound on a single offer POST
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bound on the whole exchange including waiting for connectivity
    #[serde(default = "default_resource_timeout_secs")]
    pub resource_timeout_secs: u64,

    /// Retry pause while the endpoint is unreachable
    #[serde(default = "default_connectivity_retry_ms")]
    pub connectivity_retry_ms: u64,
}

impl Default for WhepConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: default_request_timeout_secs(),
            resource_timeout_secs: default_resource_timeout_secs(),
            connectivity_retry_ms: default_connectivity_retry_ms(),
        }
    }
}

impl WhepConfig {
    pub fn timeouts(&self) -> WhepTimeouts {
        WhepTimeouts {
            request: Duration::from_secs(self.request_timeout_secs),
            resource: Duration::from_secs(self.resource_timeout_secs),
            connectivity_retry: Duration::from_millis(self.connectivity_retry_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Alert service WebSocket URL
    #[serde(default = "default_alerts_url")]
    pub url: String,

    /// Append the session's store id as `store_id` query parameter
    #[serde(default)]
    pub store_scoped: bool,

    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Keepalive ping period while in background
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// How long the new-event flag stays raised
    #[serde(default = "default_new_event_reset_ms")]
    pub new_event_reset_ms: u64,

    /// Uptime after which a socket counts as stable and the attempt counter resets
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            url: default_alerts_url(),
            store_scoped: false,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            new_event_reset_ms: default_new_event_reset_ms(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

impl AlertsConfig {
    pub fn channel_config(&self) -> Result<ChannelConfig, ConfigError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("Alerts url is not a valid URL: {}", e)))?;
        Ok(ChannelConfig {
            url,
            store_scoped: self.store_scoped,
            policy: ReconnectPolicy::with_max_attempts(self.max_reconnect_attempts),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            new_event_reset: Duration::from_millis(self.new_event_reset_ms),
            stable_after: Duration::from_secs(self.stable_after_secs),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub access_token: Option<String>,
    pub store_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `--verbose` and `OCTRUM_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.whep.request_timeout_secs == 0 || self.whep.resource_timeout_secs == 0 {
            return invalid("WHEP timeouts must be non-zero");
        }
        if self.whep.request_timeout_secs > self.whep.resource_timeout_secs {
            return invalid("WHEP request timeout cannot exceed resource timeout");
        }

        let url = match Url::parse(&self.alerts.url) {
            Ok(url) => url,
            Err(_) => return invalid("Alerts url is not a valid URL"),
        };
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return invalid("Alerts url must use ws:// or wss://");
        }
        if self.alerts.ping_interval_secs == 0 {
            return invalid("Alerts ping interval must be non-zero");
        }
        if self.alerts.max_reconnect_attempts == 0 {
            return invalid("Alerts max_reconnect_attempts must be non-zero");
        }

        Ok(())
    }
}

fn default_request_timeout_secs() -> u64 { 30 }
fn default_resource_timeout_secs() -> u64 { 60 }
fn default_connectivity_retry_ms() -> u64 { 1000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_ping_interval_secs() -> u64 { 10 }
fn default_new_event_reset_ms() -> u64 { 500 }
fn default_stable_after_secs() -> u64 { 10 }

fn default_alerts_url() -> String {
    "ws://127.0.0.1:3000/ws/alerts".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

//! Bridge configuration with defaults, loaded from a TOML file.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// How the bridge reaches the bot implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Listen for the bot implementation to connect to us (reverse WebSocket).
    #[default]
    Reverse,
    /// Connect out to the bot implementation's WebSocket endpoint.
    Forward,
}

/// Timeouts for the shutdown sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Grace window for in-flight dispatch calls after handlers detach.
    pub drain_grace_ms: u64,
    /// How long to wait for the heartbeat sweep to acknowledge cancellation.
    pub heartbeat_cancel_timeout_ms: u64,
    /// How long to wait for remaining background tasks to finish cancelling.
    pub task_cancel_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: 500,
            heartbeat_cancel_timeout_ms: 1000,
            task_cancel_timeout_ms: 2000,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn heartbeat_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_cancel_timeout_ms)
    }

    pub fn task_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.task_cancel_timeout_ms)
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: ConnectionMode,
    /// Listen host (reverse mode).
    pub host: String,
    /// Listen port (reverse mode).
    pub port: u16,
    /// Bot implementation WebSocket URL (forward mode).
    pub url: Option<String>,
    /// Shared access token. Checked on reverse connections, sent on forward ones.
    /// Wiped from memory when the config is dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Zeroizing<String>>,
    /// Expected heartbeat period; a connection is lost after twice this.
    pub heartbeat_interval_secs: u64,
    /// Event filter rule file. `None` accepts every message/notice event.
    pub filter_file: Option<PathBuf>,
    /// Timeout for a single platform action round-trip.
    pub api_timeout_secs: u64,
    pub shutdown: ShutdownConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Reverse,
            host: "127.0.0.1".to_string(),
            port: 8080,
            url: None,
            access_token: None,
            heartbeat_interval_secs: 15,
            filter_file: None,
            api_timeout_secs: 30,
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// `host:port` for the reverse listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations the adapter cannot start with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(BridgeError::Config(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(BridgeError::Config(
                "api_timeout_secs must be greater than 0".to_string(),
            ));
        }
        match self.mode {
            ConnectionMode::Reverse if self.port == 0 => Err(BridgeError::Config(
                "port must be set in reverse mode".to_string(),
            )),
            ConnectionMode::Forward if self.url.as_deref().map_or(true, str::is_empty) => Err(
                BridgeError::Config("url must be set in forward mode".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Load bridge configuration from a TOML file, falling back to defaults.
pub fn load_config(path: &Path) -> BridgeConfig {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return BridgeConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<BridgeConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                BridgeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            BridgeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.mode, ConnectionMode::Reverse);
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.shutdown.drain_grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml"));
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "port = 6700").unwrap();
        writeln!(f, "heartbeat_interval_secs = 5").unwrap();
        writeln!(f, "filter_file = \"rules.toml\"").unwrap();
        writeln!(f, "[shutdown]").unwrap();
        writeln!(f, "drain_grace_ms = 100").unwrap();
        drop(f);

        let config = load_config(&path);
        assert_eq!(config.port, 6700);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.filter_file, Some(PathBuf::from("rules.toml")));
        assert_eq!(config.shutdown.drain_grace_ms, 100);
        assert_eq!(config.shutdown.task_cancel_timeout_ms, 2000);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_access_token_loads_into_wiped_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "access_token = \"s3cret\"\n").unwrap();

        let config = load_config(&path);
        let token: &Option<Zeroizing<String>> = &config.access_token;
        assert_eq!(token.as_deref().map(String::as_str), Some("s3cret"));
        assert!(BridgeConfig::default().access_token.is_none());
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert_eq!(load_config(&path), BridgeConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = BridgeConfig {
            heartbeat_interval_secs: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_forward_needs_url() {
        let mut config = BridgeConfig {
            mode: ConnectionMode::Forward,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
        config.url = Some("ws://127.0.0.1:3001".to_string());
        assert!(config.validate().is_ok());
    }
}

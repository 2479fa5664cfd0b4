//! Runtime configuration
//!
//! Loaded from a JSON file; any field left out takes its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::ConnectorConfig;
use crate::session::DEFAULT_SESSION_CAPACITY;
use crate::uplink::client::DEFAULT_ENDPOINT;
use crate::uplink::{ReconnectPolicy, UplinkSettings};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `ws://` or `wss://` URL of the telemetry endpoint.
    pub endpoint: String,
    /// Auth token sent with every frame. Takes precedence over `token_file`.
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub upload: bool,
    /// Start with periodic status notifications enabled.
    pub background: bool,
    pub tick_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub uplink_connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub session_capacity: usize,
    pub scan_settle_ms: u64,
    pub connect_settle_ms: u64,
    /// Where the last connected device is remembered.
    pub state_file: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            token_file: None,
            upload: true,
            background: false,
            tick_interval_ms: 1_000,
            connect_timeout_ms: 15_000,
            uplink_connect_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
            backoff_initial_ms: 5_000,
            backoff_max_ms: 60_000,
            session_capacity: DEFAULT_SESSION_CAPACITY,
            scan_settle_ms: 200,
            connect_settle_ms: 300,
            state_file: PathBuf::from("heartlink-state.json"),
        }
    }
}

impl TelemetryConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// The auth token: inline if set, otherwise the trimmed contents of the
    /// token file, otherwise empty.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(token.trim().to_string());
        }
        match &self.token_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|contents| contents.trim().to_string())
                .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e))),
            None => Ok(String::new()),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            scan_settle: Duration::from_millis(self.scan_settle_ms),
            connect_settle: Duration::from_millis(self.connect_settle_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn uplink_settings(&self) -> Result<UplinkSettings, ConfigError> {
        Ok(UplinkSettings {
            endpoint: self.endpoint.clone(),
            token: self.resolve_token()?,
            connect_timeout: Duration::from_millis(self.uplink_connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            policy: ReconnectPolicy {
                initial_delay_ms: self.backoff_initial_ms,
                max_delay_ms: self.backoff_max_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = TelemetryConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        let connector = config.connector_config();
        assert_eq!(connector.connect_timeout, Duration::from_secs(15));
        assert_eq!(connector.scan_settle, Duration::from_millis(200));
        let uplink = config.uplink_settings().unwrap();
        assert_eq!(uplink.send_timeout, Duration::from_secs(5));
        assert_eq!(uplink.close_timeout, Duration::from_secs(2));
        assert_eq!(uplink.policy, ReconnectPolicy::default());
        assert_eq!(uplink.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartlink.json");
        std::fs::write(
            &path,
            r#"{ "endpoint": "wss://hr.example.org/ws", "send_timeout_ms": 2500 }"#,
        )
        .unwrap();

        let config = TelemetryConfig::load(&path).unwrap();
        assert_eq!(config.endpoint, "wss://hr.example.org/ws");
        assert_eq!(config.send_timeout_ms, 2500);
        assert_eq!(config.backoff_max_ms, 60_000);
        assert_eq!(config.session_capacity, 100);
    }

    #[test]
    fn test_load_or_default_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let mut config = TelemetryConfig::load_or_default(&path).unwrap();
        assert_eq!(config, TelemetryConfig::default());

        config.background = true;
        config.save(&path).unwrap();
        assert_eq!(TelemetryConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ endpoint: ").unwrap();
        assert!(matches!(
            TelemetryConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_token_sources() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.txt");
        std::fs::write(&token_path, "abc123\n").unwrap();

        let mut config = TelemetryConfig {
            token_file: Some(token_path),
            ..Default::default()
        };
        assert_eq!(config.resolve_token().unwrap(), "abc123");

        config.token = Some("inline".to_string());
        assert_eq!(config.resolve_token().unwrap(), "inline");

        config.token = None;
        config.token_file = Some(dir.path().join("absent.txt"));
        assert!(matches!(config.resolve_token(), Err(ConfigError::Io(_))));
    }
}

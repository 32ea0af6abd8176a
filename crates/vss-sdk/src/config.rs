//! Broker connection configuration.
//!
//! Load order (later wins): compiled defaults, an optional `./vss.toml`,
//! then `VSS_*` environment variables. Embedders that construct configs in
//! code use [`BrokerConfig::new`] plus the `with_*` builders and skip
//! loading entirely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Local config file checked by [`BrokerConfig::load`].
const LOCAL_CONFIG_FILE: &str = "vss.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value in {var}: {message}")]
    Env { var: String, message: String },
}

/// Configuration shared by [`crate::SignalClient`] and
/// [`crate::ActuatorProvider`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Databroker endpoint, scheme included (e.g. "http://databroker:55555").
    pub address: String,
    /// Transport establishment and proof-of-life probe bound, milliseconds.
    pub connect_timeout_ms: u64,
    /// Ownership confirmation bound for the provider stream, milliseconds.
    pub confirm_timeout_ms: u64,
    /// Signal path used for the proof-of-life probe on connect. Any cheap
    /// lookup works; a domain error still proves the broker is alive.
    pub probe_path: String,
    /// Depth of the outbound publish queue per provider.
    pub publish_queue_depth: usize,
    /// Depth of the inbound actuation dispatch queue per provider.
    pub actuation_queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:55555".to_string(),
            connect_timeout_ms: 2_000,
            confirm_timeout_ms: 5_000,
            probe_path: "Vehicle.Speed".to_string(),
            publish_queue_depth: 256,
            actuation_queue_depth: 64,
        }
    }
}

impl BrokerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Load configuration from defaults, `./vss.toml` if present, and
    /// `VSS_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let local = Path::new(LOCAL_CONFIG_FILE);
        let mut config = if local.exists() {
            Self::from_file(local)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a specific file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(address) = std::env::var("VSS_BROKER_ADDRESS") {
            self.address = address;
        }
        if let Ok(path) = std::env::var("VSS_PROBE_PATH") {
            self.probe_path = path;
        }
        self.connect_timeout_ms = env_ms("VSS_CONNECT_TIMEOUT_MS", self.connect_timeout_ms)?;
        self.confirm_timeout_ms = env_ms("VSS_CONFIRM_TIMEOUT_MS", self.confirm_timeout_ms)?;
        Ok(())
    }
}

fn env_ms(var: &str, current: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(text) => text.parse().map_err(|_| ConfigError::Env {
            var: var.to_string(),
            message: format!("expected milliseconds, got {:?}", text),
        }),
        Err(_) => Ok(current),
    }
}

//! Client configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Messenger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deliver conversation payloads through the relay while no direct
    /// channel to the contact is live.
    pub relay_fallback: bool,
    /// Largest outgoing payload accepted by `send`.
    pub max_payload_bytes: usize,
    /// Send-log items handed to a transport per flush.
    pub max_flush_batch: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_fallback: false,
            max_payload_bytes: 64 * 1024,
            max_flush_batch: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        // TOML file (if specified) under environment overrides
        let mut config = match std::env::var("KITH_CONFIG") {
            Ok(config_path) => Self::from_toml_file(&config_path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Override fields from `KITH_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("KITH_RELAY_FALLBACK") {
            self.relay_fallback = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::Invalid(format!("Invalid KITH_RELAY_FALLBACK: {}", other)))
                }
            };
        }
        if let Some(v) = lookup("KITH_MAX_PAYLOAD_BYTES") {
            self.max_payload_bytes = parse_usize("KITH_MAX_PAYLOAD_BYTES", &v)?;
        }
        if let Some(v) = lookup("KITH_MAX_FLUSH_BATCH") {
            self.max_flush_batch = parse_usize("KITH_MAX_FLUSH_BATCH", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes must be > 0".to_string()));
        }
        if self.max_flush_batch == 0 {
            return Err(ConfigError::Invalid("max_flush_batch must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", name, e)))
}

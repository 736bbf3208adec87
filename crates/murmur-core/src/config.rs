//! Dispatch configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `MURMUR_*` environment variables, and are validated last. The processor
//! shares one [`SharedConfig`] with whoever edits settings at runtime and
//! re-reads it for every send.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use murmur_crypto::EmailDestination;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget;
use crate::types::{extract_destination, is_external_address};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type SharedConfig = Arc<RwLock<DispatchConfig>>;

/// Upper bound on relay chains built per packet.
pub const MAX_RELAY_REDUNDANCY: u32 = 64;

/// Largest relay delay whose millisecond value fits the wire format.
pub const MAX_RELAY_DELAY_SECS: u64 = u64::MAX / 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Time between outbox scans
    pub check_interval_secs: u64,
    /// Relay hops per stored packet; 0 stores directly
    pub store_hops: u32,
    /// Independent relay chains per packet when `store_hops > 0`
    pub relay_redundancy: u32,
    pub relay_min_delay_secs: u64,
    pub relay_max_delay_secs: u64,
    /// Hand external recipients to the gateway
    pub gateway_enabled: bool,
    /// Destination of the mail gateway
    pub gateway_destination: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10 * 60,
            store_hops: 0,
            relay_redundancy: 5,
            relay_min_delay_secs: 5 * 60,
            relay_max_delay_secs: 40 * 60,
            gateway_enabled: false,
            gateway_destination: String::new(),
        }
    }
}

impl DispatchConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override fields from `MURMUR_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from any key/value source using the environment
    /// variable names.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MURMUR_CHECK_INTERVAL_SECS") {
            self.check_interval_secs = parse_var("MURMUR_CHECK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("MURMUR_STORE_HOPS") {
            self.store_hops = parse_var("MURMUR_STORE_HOPS", &v)?;
        }
        if let Some(v) = lookup("MURMUR_RELAY_REDUNDANCY") {
            self.relay_redundancy = parse_var("MURMUR_RELAY_REDUNDANCY", &v)?;
        }
        if let Some(v) = lookup("MURMUR_RELAY_MIN_DELAY_SECS") {
            self.relay_min_delay_secs = parse_var("MURMUR_RELAY_MIN_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("MURMUR_RELAY_MAX_DELAY_SECS") {
            self.relay_max_delay_secs = parse_var("MURMUR_RELAY_MAX_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("MURMUR_GATEWAY_ENABLED") {
            self.gateway_enabled = parse_var("MURMUR_GATEWAY_ENABLED", &v)?;
        }
        if let Some(v) = lookup("MURMUR_GATEWAY_DESTINATION") {
            self.gateway_destination = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("check_interval_secs must be > 0".into()));
        }
        budget::max_fragment_size(self.store_hops)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.store_hops > 0 && self.relay_redundancy == 0 {
            return Err(ConfigError::Invalid(
                "relay_redundancy must be > 0 when store_hops > 0".into(),
            ));
        }
        if self.relay_redundancy > MAX_RELAY_REDUNDANCY {
            return Err(ConfigError::Invalid(format!(
                "relay_redundancy must be <= {MAX_RELAY_REDUNDANCY}"
            )));
        }
        if self.relay_max_delay_secs > MAX_RELAY_DELAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "relay_max_delay_secs must be <= {MAX_RELAY_DELAY_SECS}"
            )));
        }
        if self.relay_min_delay_secs > self.relay_max_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "relay_min_delay_secs ({}) exceeds relay_max_delay_secs ({})",
                self.relay_min_delay_secs, self.relay_max_delay_secs
            )));
        }
        if self.gateway_enabled {
            let gateway = extract_destination(&self.gateway_destination);
            if gateway.is_empty() {
                return Err(ConfigError::Invalid(
                    "gateway_destination is required when the gateway is enabled".into(),
                ));
            }
            if is_external_address(gateway) {
                return Err(ConfigError::Invalid(
                    "gateway_destination must be a native destination".into(),
                ));
            }
            gateway
                .parse::<EmailDestination>()
                .map_err(|e| ConfigError::Invalid(format!("gateway_destination: {e}")))?;
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn relay_min_delay(&self) -> Duration {
        Duration::from_secs(self.relay_min_delay_secs)
    }

    pub fn relay_max_delay(&self) -> Duration {
        Duration::from_secs(self.relay_max_delay_secs)
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}: {e}")))
}

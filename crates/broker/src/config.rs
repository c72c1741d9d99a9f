//! Broker configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! poll_interval = "5s"
//! retry_delay = "30s"
//! overlap_policy = "reject"
//!
//! [swap_retry]
//! max_attempts = 3
//! base_backoff = "1s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rotation::retry::RetryPolicy;

/// Configuration load and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        /// File that was read
        path: PathBuf,
        /// I/O error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not match the config schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Whether an identity may belong to more than one library set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Creating or updating a set that claims another set's member fails
    #[default]
    Reject,
    /// Identities may be shared; their checkout record is shared too
    Allow,
}

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How often the scheduler looks for due rotations
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Re-queue delay after a failed rotation
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Credential creation retries inside the swap protocol
    pub swap_retry: RetryPolicy,

    /// Identity sharing between library sets
    pub overlap_policy: OverlapPolicy,

    /// Name prefix for minted admin credentials
    pub admin_credential_prefix: String,

    /// Capacity of the scheduler command channel
    pub command_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(30),
            swap_retry: RetryPolicy::default(),
            overlap_policy: OverlapPolicy::default(),
            admin_credential_prefix: "custodian".to_string(),
            command_buffer: 256,
        }
    }
}

impl BrokerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject values the scheduler or swap protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.swap_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "swap_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "command_buffer must be at least 1".into(),
            ));
        }
        if self.admin_credential_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "admin_credential_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

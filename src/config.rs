// src/config.rs
//! Binding core configuration

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BindingError, BindingResult};

/// Lowest port of the IANA dynamic range
pub const DEFAULT_MIN_PORT: u16 = 49152;

/// Highest port of the IANA dynamic range
pub const DEFAULT_MAX_PORT: u16 = 65535;

/// Random probes before the allocator falls back to a range scan
pub const DEFAULT_RANDOM_ATTEMPTS: u32 = 32;

/// What `allocate_binding` does for a connection that is already bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebindPolicy {
    /// Fail with `AlreadyBound`; callers must remove the binding first
    #[default]
    Reject,

    /// Last write wins; the displaced endpoint is stopped and its port released
    Replace,
}

/// Relay binding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Host relay endpoints bind to. `None` discovers it from local interfaces
    pub relay_host: Option<IpAddr>,

    /// Lowest relay port handed out
    pub min_port: u16,

    /// Highest relay port handed out (inclusive)
    pub max_port: u16,

    /// Random probes per allocation before scanning the range
    pub max_random_attempts: u32,

    /// Behaviour when a bound connection asks for another binding
    pub rebind_policy: RebindPolicy,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            relay_host: None,
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            max_random_attempts: DEFAULT_RANDOM_ATTEMPTS,
            rebind_policy: RebindPolicy::Reject,
        }
    }
}

impl BindingConfig {
    /// Parse a configuration from JSON text and validate it
    pub fn from_json_str(json: &str) -> BindingResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> BindingResult<Self> {
        let path = path.as_ref();
        debug!("Loading binding configuration from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the port range is usable
    pub fn validate(&self) -> BindingResult<()> {
        if self.min_port == 0 {
            return Err(BindingError::InvalidConfig(
                "min_port must be greater than 0".to_string(),
            ));
        }
        if self.min_port > self.max_port {
            return Err(BindingError::InvalidConfig(format!(
                "min_port {} exceeds max_port {}",
                self.min_port, self.max_port
            )));
        }
        Ok(())
    }

    /// Number of ports in the configured range
    pub fn port_capacity(&self) -> u32 {
        u32::from(self.max_port).saturating_sub(u32::from(self.min_port)) + 1
    }
}

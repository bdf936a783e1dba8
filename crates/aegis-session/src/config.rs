//! Session configuration.

use aegis_core::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_duration_ms() -> u64 {
    15 * 60 * 1000
}

fn default_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_expiry_check_interval_ms() -> u64 {
    1_000
}

/// Lockout and expiry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Consecutive credential rejections before lockout.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_duration_ms")]
    pub lockout_duration_ms: u64,
    /// Session lifetime when the server grant carries no expiry.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Period of the background expiry check.
    #[serde(default = "default_expiry_check_interval_ms")]
    pub expiry_check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration_ms: default_lockout_duration_ms(),
            default_ttl_ms: default_ttl_ms(),
            expiry_check_interval_ms: default_expiry_check_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn lockout_duration(&self) -> Duration {
        Duration::from_millis(self.lockout_duration_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_failed_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "session.max_failed_attempts must be at least 1".to_string(),
            ));
        }
        if self.lockout_duration_ms == 0 || self.default_ttl_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "session durations must be positive".to_string(),
            ));
        }
        if self.expiry_check_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "session.expiry_check_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

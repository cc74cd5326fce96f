//! Connection manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;

/// Configuration for [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Delay schedule shared by initial-connect retries and manual reconnects.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Total open attempts for an initial connect before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_connect_attempts: u32,
    /// Reconnect attempts after a mid-session drop, for transports without
    /// their own retry loop.
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    /// Server method that receives the identity token.
    #[serde(default = "default_registration_method")]
    pub registration_method: String,
    /// Per-call timeout for the registration invocation.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    /// Extra registration attempts after a failure. `0` keeps the lenient
    /// behavior: a failed registration is logged and left alone.
    #[serde(default)]
    pub registration_retries: u32,
    /// Capacity of the observer event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_attempts() -> u32 { 5 }
fn default_registration_method() -> String { "Token".into() }
fn default_registration_timeout_ms() -> u64 { 10_000 }
fn default_event_capacity() -> usize { 64 }

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_connect_attempts: default_max_attempts(),
            max_reconnect_attempts: default_max_attempts(),
            registration_method: default_registration_method(),
            registration_timeout_ms: default_registration_timeout_ms(),
            registration_retries: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_connect_attempts" });
        }
        if self.registration_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "registration_timeout_ms" });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero { field: "event_capacity" });
        }
        if self.registration_method.trim().is_empty() {
            return Err(ConfigError::EmptyMethod);
        }
        Ok(())
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

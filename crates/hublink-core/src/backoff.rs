//! Capped exponential backoff.
//!
//! `delay(attempt) = min(base * 2^attempt, cap)` where `attempt` is the
//! 0-indexed count of consecutive failures since the last success.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for the backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay for attempt 0 (the first reconnect retry), in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_base_ms() -> u64 { 1_000 }
fn default_cap_ms() -> u64 { 16_000 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 {
            return Err(ConfigError::Zero { field: "backoff.base_ms" });
        }
        if self.cap_ms < self.base_ms {
            return Err(ConfigError::CapBelowBase {
                base_ms: self.base_ms,
                cap_ms: self.cap_ms,
            });
        }
        Ok(())
    }
}

/// Stateless backoff policy: computes the delay for a given attempt number.
///
/// Holds no attempt counter of its own; callers own their counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt` (0-indexed). Total for every `u32`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Same as [`delay`](Self::delay), in milliseconds.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let cap = self.config.cap_ms;
        // 2^64 overflows; anything past 63 doublings is at the cap anyway
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.config.base_ms.saturating_mul(factor).min(cap)
    }

    /// The full schedule for `attempts` consecutive failures.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (0..attempts).map(|a| self.delay(a)).collect()
    }
}

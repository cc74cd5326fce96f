use std::time::Duration;

use serde::{Deserialize, Serialize};

use hublink_core::BackoffConfig;

/// Configuration for [`HubTransport`](crate::HubTransport).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub endpoint, e.g. `https://example.com/signalr`.
    #[serde(default)]
    pub url: String,
    /// Connect straight to the WebSocket endpoint without the negotiate step.
    #[serde(default)]
    pub skip_negotiation: bool,
    /// Budget for TCP/TLS connect plus the protocol handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Interval between keepalive pings sent to the server.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// The link is considered dead when nothing arrives for this long.
    #[serde(default = "default_server_timeout_ms")]
    pub server_timeout_ms: u64,
    /// How long `send` waits for the server's completion.
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
    /// Invocation target whose first argument is a notification payload.
    #[serde(default = "default_message_target")]
    pub message_target: String,
    /// Cap on native reconnect attempts per outage. `None` retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Delay schedule for native reconnects.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_handshake_timeout_ms() -> u64 { 15_000 }
fn default_keepalive_interval_ms() -> u64 { 15_000 }
fn default_server_timeout_ms() -> u64 { 30_000 }
fn default_invocation_timeout_ms() -> u64 { 10_000 }
fn default_message_target() -> String { "message".into() }

impl Default for HubConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl HubConfig {
    /// Defaults for everything but the endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            skip_negotiation: false,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            server_timeout_ms: default_server_timeout_ms(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            message_target: default_message_target(),
            max_reconnect_attempts: None,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }
}

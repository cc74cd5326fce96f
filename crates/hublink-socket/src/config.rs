use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`SocketTransport`](crate::SocketTransport).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Endpoint; `http(s)` is mapped to `ws(s)`.
    #[serde(default)]
    pub url: String,
    /// Envelope event name that carries notification payloads.
    #[serde(default = "default_message_event")]
    pub message_event: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_message_event() -> String { "message".into() }
fn default_connect_timeout_ms() -> u64 { 10_000 }

impl Default for SocketConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message_event: default_message_event(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

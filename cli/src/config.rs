//! `hublink.yaml`: file-based configuration with command-line overrides.
//!
//! ```yaml
//! transport: hub            # hub | socket
//! url: https://example.com/signalr
//! token: 3f9c...
//! manager:
//!   max_connect_attempts: 5
//!   backoff: { base_ms: 1000, cap_ms: 16000 }
//! hub:
//!   skip_negotiation: false
//!   keepalive_interval_ms: 15000
//! socket:
//!   message_event: message
//! log:
//!   level: info
//!   components: { hublink-hub: debug }
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use hublink_core::ManagerConfig;
use hublink_hub::HubConfig;
use hublink_socket::SocketConfig;

use crate::logging::LogConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// JSON hub protocol with native reconnect
    #[default]
    Hub,
    /// Plain JSON over WebSocket
    Socket,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Endpoint; overrides `hub.url` / `socket.url` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Identity token announced after every connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from `path`, or start from defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.manager.validate().context("invalid manager settings")?;
        Ok(config)
    }

    /// Hub settings with the endpoint resolved.
    pub fn hub_config(&self) -> Result<HubConfig> {
        let mut hub = self.hub.clone();
        hub.url = self.endpoint(&hub.url)?;
        Ok(hub)
    }

    /// Socket settings with the endpoint resolved.
    pub fn socket_config(&self) -> Result<SocketConfig> {
        let mut socket = self.socket.clone();
        socket.url = self.endpoint(&socket.url)?;
        Ok(socket)
    }

    fn endpoint(&self, section_url: &str) -> Result<String> {
        match self.url.as_deref() {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ if !section_url.is_empty() => Ok(section_url.to_string()),
            _ => bail!("no endpoint configured: pass --url, set HUBLINK_URL or `url:` in the config file"),
        }
    }
}

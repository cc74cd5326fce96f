//! hublink-hub: hub-protocol WebSocket transport for Hublink.
//!
//! Speaks the JSON hub protocol (negotiate, handshake, record-separated
//! frames) and re-establishes dropped links itself, so the connection
//! manager only observes `Reconnecting` / `Reconnected` events.
//!
//! # Example
//!
//! ```rust,no_run
//! use hublink_core::{ConnectionManager, ManagerConfig};
//! use hublink_hub::HubConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = hublink_hub::factory(HubConfig::new("https://example.com/signalr"));
//! let manager = ConnectionManager::new(ManagerConfig::default(), factory)?;
//! let _sub = manager.subscribe(|msg| {
//!     println!("{msg}");
//!     Ok(())
//! });
//! manager.connect("my-token").await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod negotiate;
pub mod protocol;

use std::sync::Arc;

use hublink_core::Transport;

pub use client::HubTransport;
pub use config::HubConfig;

/// A transport factory producing a fresh [`HubTransport`] per connection.
pub fn factory(config: HubConfig) -> impl Fn() -> Arc<dyn Transport> + Send + Sync + 'static {
    move || Arc::new(HubTransport::new(config.clone())) as Arc<dyn Transport>
}

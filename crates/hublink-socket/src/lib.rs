//! hublink-socket: plain JSON WebSocket transport for Hublink.
//!
//! Has no reconnect logic of its own; pair it with the connection
//! manager's manual reconnect loop.

pub mod client;
pub mod config;
pub mod framing;

use std::sync::Arc;

use hublink_core::Transport;

pub use client::SocketTransport;
pub use config::SocketConfig;

/// A transport factory producing a fresh [`SocketTransport`] per connection.
pub fn factory(config: SocketConfig) -> impl Fn() -> Arc<dyn Transport> + Send + Sync + 'static {
    move || Arc::new(SocketTransport::new(config.clone())) as Arc<dyn Transport>
}

//! The `Transport` trait: the duplex channel abstraction the manager drives.
//!
//! A transport is single-use: the manager asks its [`TransportFactory`] for a
//! fresh instance for every connection and releases the old one first.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Events a transport reports after a successful `open()`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound notification payload.
    Message(Value),
    /// The link dropped and the transport's own retry loop is about to make
    /// attempt number `attempt` (1-based within the current outage).
    Reconnecting {
        attempt: u32,
        reason: Option<String>,
    },
    /// The transport's own retry loop re-established the link.
    Reconnected,
    /// The link is gone for good; no further events follow.
    Closed(Option<String>),
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A duplex, message-oriented channel.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the link. Resolves once the transport is usable; events
    /// are reported on the returned receiver until [`TransportEvent::Closed`].
    async fn open(&self) -> Result<TransportEvents, TransportError>;

    /// Invoke `method` on the server with `payload`. Transports with
    /// acknowledgment semantics resolve when the server answers.
    async fn send(&self, method: &str, payload: Value) -> Result<(), TransportError>;

    /// Release the link. Must be safe to call on an unopened or already
    /// closed transport.
    async fn close(&self) -> Result<(), TransportError>;

    /// `true` if the transport re-establishes dropped links on its own and
    /// reports that through `Reconnecting` / `Reconnected` events.
    fn supports_reconnect(&self) -> bool {
        false
    }

    /// Short name for logs (e.g. `"hub"`, `"socket"`).
    fn kind(&self) -> &'static str;

    /// The endpoint this transport talks to.
    fn url(&self) -> &str;
}

/// Creates one transport per connection attempt.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn Transport> {
        self()
    }
}

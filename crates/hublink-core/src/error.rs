//! Error types shared by the manager and every transport.

use thiserror::Error;

/// Errors that can occur while opening, using or closing a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket connect/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP request failed (negotiate endpoint unreachable, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The server rejected or never answered the protocol handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The hub answered an invocation with an error.
    #[error("Hub error: {message}")]
    Hub { message: String },

    /// Operation timed out after the configured duration.
    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The transport has not been opened (or was already closed).
    #[error("Transport not connected")]
    NotConnected,

    /// The connection was closed while the operation was pending.
    #[error("Transport closed")]
    Closed,

    /// Frame could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Http(_)
                | Self::Handshake(_)
                | Self::Timeout { .. }
                | Self::Closed
        )
    }
}

/// Error returned by a consumer callback registered with the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("backoff cap ({cap_ms}ms) is smaller than the base delay ({base_ms}ms)")]
    CapBelowBase { base_ms: u64, cap_ms: u64 },

    #[error("registration method must not be empty")]
    EmptyMethod,
}

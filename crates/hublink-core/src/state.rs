//! Connection states and the events reported to observers.
//!
//! State transitions:
//! - `Idle` → `Connecting`:            `connect(identity)`
//! - `Connecting` → `Connected`:       transport opened (identity registered)
//! - `Connecting` → `Disconnected`:    open failed (retry scheduled while attempts remain)
//! - `Disconnected` → `Connecting`:    scheduled retry fires
//! - `Connected` → `Reconnecting`:     unexpected drop
//! - `Reconnecting` → `Connected`:     link re-established (identity re-registered)
//! - `Reconnecting` → `Disconnected`:  retries exhausted
//! - any → `Disconnected`:             `disconnect()`

use serde::Serialize;

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// An open attempt is in flight.
    Connecting,
    /// Link is up.
    Connected,
    /// Link dropped; a retry loop is running.
    Reconnecting,
    /// Link released (explicitly, or after giving up).
    Disconnected,
}

impl ConnectionState {
    /// Returns `true` while an attempt is underway.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Observable events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The state machine moved.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The identity was announced to the server.
    Registered { identity: String },
    /// Announcing the identity failed; the link stays up regardless.
    RegistrationFailed { identity: String, reason: String },
    /// An initial-connect attempt failed and another one is scheduled.
    RetryScheduled {
        identity: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Initial connection gave up after `attempts` failures.
    RetriesExhausted { identity: String, attempts: u32 },
    /// Reconnecting after a mid-session drop gave up.
    ReconnectExhausted { identity: String, attempts: u32 },
    /// The transport closed for good without a retry episode.
    ConnectionLost {
        identity: String,
        reason: Option<String>,
    },
}

impl ConnectionEvent {
    /// Returns `true` for the conditions that leave the manager terminally
    /// `Disconnected` until the caller connects again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. }
                | Self::ReconnectExhausted { .. }
                | Self::ConnectionLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_serialize() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        let json = serde_json::to_value(ConnectionEvent::RetriesExhausted {
            identity: "abc".into(),
            attempts: 5,
        })
        .unwrap();
        assert_eq!(json["event"], "retries_exhausted");
        assert_eq!(json["attempts"], 5);
    }

    #[test]
    fn terminal_events() {
        assert!(ConnectionEvent::ReconnectExhausted { identity: "x".into(), attempts: 1 }
            .is_terminal());
        assert!(!ConnectionEvent::Registered { identity: "x".into() }.is_terminal());
        assert!(ConnectionState::Connecting.is_transitional());
        assert!(!ConnectionState::Disconnected.is_transitional());
    }
}

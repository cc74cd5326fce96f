//! hublink-core: connection state machine and fan-out for server-push channels.
//!
//! # Overview
//!
//! Hublink keeps a long-lived notification channel to a backend alive across
//! network blips, server restarts and identity switches. The core crate defines:
//!
//! - [`ConnectionManager`]: owns one transport at a time, retries with
//!   backoff and re-announces the bound identity after every (re)connection
//! - [`Transport`] / [`TransportFactory`]: the duplex channel abstraction
//! - [`MessageDispatcher`]: ordered, failure-isolated consumer registry
//! - [`BackoffPolicy`]: capped exponential delay schedule
//! - [`IdentityRegistrar`]: the identity announcement call
//!
//! Concrete transports live in `hublink-hub` and `hublink-socket`.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod registrar;
pub mod state;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use config::ManagerConfig;
pub use dispatcher::{MessageDispatcher, MessageHandler, Subscription, SubscriptionId};
pub use error::{ConfigError, HandlerError, TransportError};
pub use manager::ConnectionManager;
pub use registrar::IdentityRegistrar;
pub use state::{ConnectionEvent, ConnectionState};
pub use transport::{Transport, TransportEvent, TransportEvents, TransportFactory};

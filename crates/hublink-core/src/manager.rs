//! The connection manager: owns one transport at a time and keeps it alive.
//!
//! Every asynchronous continuation (open completion, retry timer, event pump,
//! reconnect loop) captures the connection epoch it was started for and
//! re-checks it under the lock before touching state. `connect` with a new
//! identity and `disconnect` bump the epoch, so late completions of stale
//! attempts are released instead of applied.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;

use crate::backoff::BackoffPolicy;
use crate::config::ManagerConfig;
use crate::dispatcher::{MessageDispatcher, Subscription};
use crate::error::{ConfigError, HandlerError};
use crate::registrar::IdentityRegistrar;
use crate::state::{ConnectionEvent, ConnectionState};
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};

/// The single connection record.
struct Connection {
    state: ConnectionState,
    identity: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever the current connection is abandoned.
    epoch: u64,
    /// Bumped by every `connect` / `disconnect` call; the newest call wins.
    requested: u64,
    /// An open attempt is running or a retry of one is scheduled.
    attempt_in_progress: bool,
    /// Consecutive initial-connect failures.
    connect_attempts: u32,
    /// Consecutive reconnect attempts in the current outage.
    reconnect_attempts: u32,
    attempt_task: Option<AbortHandle>,
    reconnect_task: Option<AbortHandle>,
}

struct Shared {
    config: ManagerConfig,
    backoff: BackoffPolicy,
    registrar: IdentityRegistrar,
    factory: Box<dyn TransportFactory>,
    dispatcher: MessageDispatcher,
    conn: Mutex<Connection>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

/// Resilient connection manager.
///
/// Cheap to clone; all clones drive the same connection. Construct one per
/// composition root and hand clones to whoever needs it.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

enum Plan {
    Skip,
    Fresh,
    Rebind,
}

impl ConnectionManager {
    /// Create a manager in the `Idle` state.
    pub fn new(
        config: ManagerConfig,
        factory: impl TransportFactory,
    ) -> Result<Self, ConfigError> {
        Self::with_dispatcher(config, factory, MessageDispatcher::new())
    }

    /// Create a manager that delivers into an existing dispatcher.
    pub fn with_dispatcher(
        config: ManagerConfig,
        factory: impl TransportFactory,
        dispatcher: MessageDispatcher,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                backoff: BackoffPolicy::new(config.backoff),
                registrar: IdentityRegistrar::from_config(&config),
                config,
                factory: Box::new(factory),
                dispatcher,
                conn: Mutex::new(Connection {
                    state: ConnectionState::Idle,
                    identity: None,
                    transport: None,
                    epoch: 0,
                    requested: 0,
                    attempt_in_progress: false,
                    connect_attempts: 0,
                    reconnect_attempts: 0,
                    attempt_task: None,
                    reconnect_task: None,
                }),
                state_tx,
                events_tx,
            }),
        })
    }

    // ─── Caller-facing API ────────────────────────────────────────────────────

    /// Bind the channel to `identity` and connect.
    ///
    /// Resolves once the first open attempt has finished; failed attempts
    /// are retried in the background. Network failures are never returned;
    /// watch [`state`](Self::state) or [`events`](Self::events) instead.
    pub async fn connect(&self, identity: impl Into<String>) {
        let identity = identity.into();

        let (ticket, plan) = {
            let mut conn = self.lock();
            conn.requested += 1;
            let same = conn.identity.as_deref() == Some(identity.as_str());
            let live = matches!(
                conn.state,
                ConnectionState::Connected | ConnectionState::Reconnecting
            );
            let plan = if conn.attempt_in_progress || live {
                if same {
                    Plan::Skip
                } else {
                    Plan::Rebind
                }
            } else {
                Plan::Fresh
            };
            (conn.requested, plan)
        };

        match plan {
            Plan::Skip => {
                tracing::debug!(identity = %identity, "already connected or connecting");
                return;
            }
            Plan::Rebind => {
                tracing::info!(identity = %identity, "rebinding to a new identity");
                self.release().await;
            }
            Plan::Fresh => {}
        }

        let (task, stale) = {
            let mut conn = self.lock();
            if conn.requested != ticket {
                tracing::debug!(identity = %identity, "superseded by a newer connect/disconnect");
                return;
            }
            conn.epoch += 1;
            let epoch = conn.epoch;
            let stale = conn.transport.take();
            conn.identity = Some(identity.clone());
            conn.attempt_in_progress = true;
            conn.connect_attempts = 0;
            conn.reconnect_attempts = 0;
            self.transition(&mut conn, ConnectionState::Connecting);

            let task = tokio::spawn(self.attempt(identity, epoch));
            conn.attempt_task = Some(task.abort_handle());
            (task, stale)
        };

        if let Some(old) = stale {
            close_quietly(old).await;
        }
        // Cancelled when a newer call takes over; that is not an error.
        let _ = task.await;
    }

    /// Release the transport, clear the identity and cancel pending retries.
    /// A no-op when already disconnected.
    pub async fn disconnect(&self) {
        self.lock().requested += 1;
        self.release().await;
    }

    /// Disconnect and drop every subscription.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shared.dispatcher.clear();
    }

    /// Register a consumer for inbound messages. Subscriptions survive
    /// reconnects and identity changes.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&serde_json::Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(handler)
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The identity currently bound, if any.
    pub fn identity(&self) -> Option<String> {
        self.lock().identity.clone()
    }

    /// Consecutive initial-connect failures so far.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Reconnect attempts made in the current outage.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// `true` while an open attempt, a retry timer or a reconnect loop is live.
    pub fn has_pending_attempt(&self) -> bool {
        let conn = self.lock();
        let live = |h: &Option<AbortHandle>| h.as_ref().is_some_and(|h| !h.is_finished());
        live(&conn.attempt_task) || live(&conn.reconnect_task)
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Observable event channel (transitions, registrations, terminal failures).
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    // ─── State machine internals ──────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.shared.conn.lock().unwrap()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.shared.events_tx.send(event);
    }

    fn transition(&self, conn: &mut Connection, to: ConnectionState) {
        let from = conn.state;
        if from == to {
            return;
        }
        conn.state = to;
        self.shared.state_tx.send_replace(to);
        tracing::info!(
            %from,
            %to,
            identity = conn.identity.as_deref().unwrap_or(""),
            "connection state changed"
        );
        self.emit(ConnectionEvent::StateChanged { from, to });
    }

    /// Tear the current connection down without invalidating in-flight
    /// `connect` calls (they re-check their ticket themselves).
    async fn release(&self) {
        let transport = {
            let mut conn = self.lock();
            conn.epoch += 1;
            if let Some(task) = conn.attempt_task.take() {
                task.abort();
            }
            if let Some(task) = conn.reconnect_task.take() {
                task.abort();
            }
            conn.attempt_in_progress = false;
            conn.connect_attempts = 0;
            conn.reconnect_attempts = 0;
            let transport = conn.transport.take();
            self.transition(&mut conn, ConnectionState::Disconnected);
            conn.identity = None;
            transport
        };

        if let Some(transport) = transport {
            close_quietly(transport).await;
        }
    }

    /// One initial-connect attempt; schedules the next one on failure.
    fn attempt(&self, identity: String, epoch: u64) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let transport = this.shared.factory.create();
            {
                let mut conn = this.lock();
                if conn.epoch != epoch {
                    return;
                }
                conn.transport = Some(transport.clone());
                this.transition(&mut conn, ConnectionState::Connecting);
            }

            tracing::info!(
                identity = %identity,
                kind = transport.kind(),
                url = transport.url(),
                "opening transport"
            );

            match transport.open().await {
                Ok(events) => {
                    let accepted = {
                        let mut conn = this.lock();
                        if conn.epoch != epoch {
                            false
                        } else {
                            conn.attempt_in_progress = false;
                            conn.connect_attempts = 0;
                            conn.reconnect_attempts = 0;
                            conn.attempt_task = None;
                            this.transition(&mut conn, ConnectionState::Connected);
                            tokio::spawn(this.pump(events, epoch));
                            true
                        }
                    };
                    if !accepted {
                        tracing::debug!(identity = %identity, "open finished after being superseded");
                        close_quietly(transport).await;
                        return;
                    }
                    this.register(&identity, epoch, transport).await;
                }
                Err(e) => {
                    {
                        let mut conn = this.lock();
                        if conn.epoch != epoch {
                            return;
                        }
                        conn.transport = None;
                        conn.connect_attempts += 1;
                        let failures = conn.connect_attempts;
                        this.transition(&mut conn, ConnectionState::Disconnected);

                        if failures < this.shared.config.max_connect_attempts {
                            let delay = this.shared.backoff.delay(failures);
                            tracing::warn!(
                                identity = %identity,
                                error = %e,
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                "connect failed, retrying"
                            );
                            let retry = this.clone();
                            let id = identity.clone();
                            let task = tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                retry.attempt(id, epoch).await;
                            });
                            conn.attempt_task = Some(task.abort_handle());
                            this.emit(ConnectionEvent::RetryScheduled {
                                identity: identity.clone(),
                                attempt: failures,
                                delay_ms: delay.as_millis() as u64,
                            });
                        } else {
                            tracing::error!(
                                identity = %identity,
                                error = %e,
                                attempts = failures,
                                "connect retries exhausted"
                            );
                            conn.attempt_in_progress = false;
                            conn.attempt_task = None;
                            this.emit(ConnectionEvent::RetriesExhausted {
                                identity: identity.clone(),
                                attempts: failures,
                            });
                        }
                    }
                    close_quietly(transport).await;
                }
            }
        }
        .boxed()
    }

    /// Announce the identity once for the transition into `Connected` that
    /// belongs to `epoch`.
    async fn register(&self, identity: &str, epoch: u64, transport: Arc<dyn Transport>) {
        {
            let conn = self.lock();
            if conn.epoch != epoch || conn.state != ConnectionState::Connected {
                return;
            }
        }

        let result = self.shared.registrar.register(transport.as_ref(), identity).await;

        if self.lock().epoch != epoch {
            return;
        }
        match result {
            Ok(()) => self.emit(ConnectionEvent::Registered {
                identity: identity.to_string(),
            }),
            Err(e) => self.emit(ConnectionEvent::RegistrationFailed {
                identity: identity.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Feed transport events into the state machine and the dispatcher.
    fn pump(&self, mut events: TransportEvents, epoch: u64) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            loop {
                let event = events
                    .recv()
                    .await
                    .unwrap_or_else(|| TransportEvent::Closed(Some("event stream ended".into())));

                if this.lock().epoch != epoch {
                    break;
                }

                match event {
                    TransportEvent::Message(payload) => {
                        this.shared.dispatcher.dispatch(&payload);
                    }
                    TransportEvent::Reconnecting { attempt, reason } => {
                        let mut conn = this.lock();
                        if conn.epoch != epoch {
                            break;
                        }
                        conn.reconnect_attempts = attempt;
                        tracing::warn!(
                            attempt,
                            reason = reason.as_deref().unwrap_or("unknown"),
                            "transport reconnecting"
                        );
                        this.transition(&mut conn, ConnectionState::Reconnecting);
                    }
                    TransportEvent::Reconnected => {
                        let ready = {
                            let mut conn = this.lock();
                            if conn.epoch != epoch {
                                break;
                            }
                            conn.reconnect_attempts = 0;
                            this.transition(&mut conn, ConnectionState::Connected);
                            conn.identity.clone().zip(conn.transport.clone())
                        };
                        if let Some((identity, transport)) = ready {
                            tracing::info!(identity = %identity, "transport reconnected, re-registering");
                            // Messages keep flowing while the server answers.
                            let reg = this.clone();
                            tokio::spawn(async move {
                                reg.register(&identity, epoch, transport).await;
                            });
                        }
                    }
                    TransportEvent::Closed(reason) => {
                        this.on_closed(epoch, reason).await;
                        break;
                    }
                }
            }
        }
        .boxed()
    }

    async fn on_closed(&self, epoch: u64, reason: Option<String>) {
        let transport = {
            let mut conn = self.lock();
            if conn.epoch != epoch {
                return;
            }
            let transport = conn.transport.take();
            let identity = conn.identity.clone().unwrap_or_default();
            let native = transport.as_ref().is_some_and(|t| t.supports_reconnect());
            let was = conn.state;

            if !native
                && was == ConnectionState::Connected
                && self.shared.config.max_reconnect_attempts > 0
            {
                tracing::warn!(
                    identity = %identity,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "connection dropped, reconnecting"
                );
                conn.reconnect_attempts = 0;
                conn.attempt_in_progress = true;
                self.transition(&mut conn, ConnectionState::Reconnecting);
                let task = tokio::spawn(self.reconnect(identity, epoch));
                conn.reconnect_task = Some(task.abort_handle());
            } else {
                conn.attempt_in_progress = false;
                self.transition(&mut conn, ConnectionState::Disconnected);
                if was == ConnectionState::Reconnecting {
                    tracing::error!(
                        identity = %identity,
                        attempts = conn.reconnect_attempts,
                        "reconnect attempts exhausted"
                    );
                    self.emit(ConnectionEvent::ReconnectExhausted {
                        identity,
                        attempts: conn.reconnect_attempts,
                    });
                } else {
                    tracing::error!(
                        identity = %identity,
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "connection lost"
                    );
                    self.emit(ConnectionEvent::ConnectionLost { identity, reason });
                }
            }
            transport
        };

        if let Some(transport) = transport {
            close_quietly(transport).await;
        }
    }

    /// Reconnect loop for transports without their own retry.
    fn reconnect(&self, identity: String, epoch: u64) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            loop {
                let attempt = {
                    let mut conn = this.lock();
                    if conn.epoch != epoch {
                        return;
                    }
                    let attempt = conn.reconnect_attempts;
                    if attempt >= this.shared.config.max_reconnect_attempts {
                        tracing::error!(identity = %identity, attempts = attempt, "reconnect attempts exhausted");
                        conn.attempt_in_progress = false;
                        conn.reconnect_task = None;
                        this.transition(&mut conn, ConnectionState::Disconnected);
                        this.emit(ConnectionEvent::ReconnectExhausted {
                            identity: identity.clone(),
                            attempts: attempt,
                        });
                        return;
                    }
                    attempt
                };

                let delay = this.shared.backoff.delay(attempt);
                tracing::info!(
                    identity = %identity,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after delay"
                );
                tokio::time::sleep(delay).await;

                let transport = this.shared.factory.create();
                {
                    let mut conn = this.lock();
                    if conn.epoch != epoch {
                        return;
                    }
                    conn.reconnect_attempts += 1;
                    conn.transport = Some(transport.clone());
                }

                match transport.open().await {
                    Ok(events) => {
                        let accepted = {
                            let mut conn = this.lock();
                            if conn.epoch != epoch {
                                false
                            } else {
                                conn.attempt_in_progress = false;
                                conn.reconnect_attempts = 0;
                                conn.reconnect_task = None;
                                this.transition(&mut conn, ConnectionState::Connected);
                                tokio::spawn(this.pump(events, epoch));
                                true
                            }
                        };
                        if accepted {
                            tracing::info!(identity = %identity, "reconnected, re-registering");
                            this.register(&identity, epoch, transport).await;
                        } else {
                            close_quietly(transport).await;
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(identity = %identity, error = %e, "reconnect attempt failed");
                        {
                            let mut conn = this.lock();
                            if conn.epoch != epoch {
                                return;
                            }
                            conn.transport = None;
                        }
                        close_quietly(transport).await;
                    }
                }
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &conn.state)
            .field("identity", &conn.identity)
            .field("subscriptions", &self.shared.dispatcher.len())
            .finish()
    }
}

async fn close_quietly(transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        tracing::warn!(kind = transport.kind(), error = %e, "error closing transport");
    }
}

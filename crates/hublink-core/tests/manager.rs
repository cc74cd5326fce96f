//! Connection manager integration tests.
//!
//! Every test drives the manager against `ScriptedTransport`, an in-memory
//! transport whose opens can be made to fail or to wait on a gate, and
//! whose event stream is pushed by the test.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Instant;

use hublink_core::{
    ConnectionEvent, ConnectionManager, ConnectionState, ManagerConfig, Transport,
    TransportError, TransportEvent, TransportEvents,
};

// ─── Scripted transport ───────────────────────────────────────────────────────

struct ScriptedTransport {
    native_reconnect: bool,
    fail_open: bool,
    fail_send: bool,
    stall_sends_after: Option<usize>,
    gate: Option<Arc<Semaphore>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Mutex<Vec<(String, Value)>>,
    opened_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    fn emit(&self, event: TransportEvent) {
        let tx = self.events.lock().unwrap();
        tx.as_ref().expect("transport not open").send(event).unwrap();
    }

    fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<TransportEvents, TransportError> {
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_open {
            return Err(TransportError::WebSocket("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, method: &str, payload: Value) -> Result<(), TransportError> {
        let sent = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((method.to_string(), payload));
            sent.len()
        };
        if self.stall_sends_after.is_some_and(|n| sent > n) {
            std::future::pending::<()>().await;
        }
        if self.fail_send {
            return Err(TransportError::Hub { message: "unknown method".into() });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }

    fn supports_reconnect(&self) -> bool {
        self.native_reconnect
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn url(&self) -> &str {
        "mem://scripted"
    }
}

/// Shared script controlling every transport the factory creates.
#[derive(Default)]
struct Script {
    native_reconnect: AtomicBool,
    fail_opens: AtomicU32,
    fail_send: AtomicBool,
    stall_sends_after: Mutex<Option<usize>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl Script {
    fn transports(&self) -> Vec<Arc<ScriptedTransport>> {
        self.created.lock().unwrap().clone()
    }

    fn transport(&self, n: usize) -> Arc<ScriptedTransport> {
        self.transports()[n].clone()
    }

    fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn live(&self) -> usize {
        self.transports().iter().filter(|t| !t.is_closed()).count()
    }

    fn gated(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn create(&self) -> Arc<ScriptedTransport> {
        let fail_open = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let t = Arc::new(ScriptedTransport {
            native_reconnect: self.native_reconnect.load(Ordering::SeqCst),
            fail_open,
            fail_send: self.fail_send.load(Ordering::SeqCst),
            stall_sends_after: *self.stall_sends_after.lock().unwrap(),
            gate: self.gate.lock().unwrap().clone(),
            events: Mutex::new(None),
            sent: Mutex::new(vec![]),
            opened_at: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(t.clone());
        t
    }
}

fn manager_with(script: &Arc<Script>, config: ManagerConfig) -> ConnectionManager {
    let s = script.clone();
    ConnectionManager::new(config, move || -> Arc<dyn Transport> { s.create() }).unwrap()
}

fn manager(script: &Arc<Script>) -> ConnectionManager {
    manager_with(script, ManagerConfig::default())
}

fn token(id: &str) -> (String, Value) {
    ("Token".to_string(), Value::String(id.to_string()))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut out = vec![];
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

// ─── Connect / registration ───────────────────────────────────────────────────

#[tokio::test]
async fn connect_opens_and_registers_once() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    let mut events = m.events();
    assert_eq!(m.state(), ConnectionState::Idle);

    m.connect("abc").await;

    assert!(m.is_connected());
    assert_eq!(m.identity().as_deref(), Some("abc"));
    assert_eq!(script.count(), 1);
    assert_eq!(script.transport(0).sent(), vec![token("abc")]);
    assert!(drain(&mut events).contains(&ConnectionEvent::Registered { identity: "abc".into() }));
}

#[tokio::test]
async fn connect_same_identity_while_connected_is_noop() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    m.connect("abc").await;
    m.connect("abc").await;

    assert_eq!(script.count(), 1);
    assert_eq!(script.transport(0).sent().len(), 1);
    assert!(m.is_connected());
}

#[tokio::test]
async fn rapid_duplicate_connects_make_one_attempt() {
    let script = Arc::new(Script::default());
    let gate = script.gated();
    let m = manager(&script);

    let first = {
        let m = m.clone();
        tokio::spawn(async move { m.connect("abc").await })
    };
    settle().await;
    assert_eq!(m.state(), ConnectionState::Connecting);

    // Returns straight away: an attempt for the same identity is in flight.
    m.connect("abc").await;

    gate.add_permits(1);
    first.await.unwrap();

    assert_eq!(script.count(), 1);
    assert_eq!(script.transport(0).sent(), vec![token("abc")]);
    assert!(m.is_connected());
}

#[tokio::test]
async fn rebinding_before_first_open_resolves_keeps_only_newest() {
    let script = Arc::new(Script::default());
    let gate = script.gated();
    let m = manager(&script);

    let a = {
        let m = m.clone();
        tokio::spawn(async move { m.connect("A").await })
    };
    settle().await;
    let b = {
        let m = m.clone();
        tokio::spawn(async move { m.connect("B").await })
    };
    settle().await;

    gate.add_permits(2);
    a.await.unwrap();
    b.await.unwrap();
    settle().await;

    assert_eq!(m.identity().as_deref(), Some("B"));
    assert!(m.is_connected());
    assert_eq!(script.count(), 2);
    assert_eq!(script.live(), 1);
    assert!(script.transport(0).is_closed());
    assert!(script.transport(0).sent().is_empty());
    assert_eq!(script.transport(1).sent(), vec![token("B")]);
}

#[tokio::test]
async fn connected_rebind_releases_old_transport_first() {
    let script = Arc::new(Script::default());
    let m = manager(&script);

    m.connect("A").await;
    m.connect("B").await;

    assert_eq!(m.identity().as_deref(), Some("B"));
    assert!(script.transport(0).is_closed());
    assert_eq!(script.live(), 1);
    assert_eq!(script.transport(1).sent(), vec![token("B")]);
}

#[tokio::test]
async fn registration_failure_leaves_link_connected() {
    let script = Arc::new(Script::default());
    script.fail_send.store(true, Ordering::SeqCst);
    let m = manager(&script);
    let mut events = m.events();

    m.connect("abc").await;

    assert!(m.is_connected());
    assert_eq!(script.transport(0).sent().len(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::RegistrationFailed { identity, .. } if identity == "abc")));
}

#[tokio::test]
async fn non_transient_registration_errors_are_not_retried() {
    let script = Arc::new(Script::default());
    script.fail_send.store(true, Ordering::SeqCst);
    let config = ManagerConfig {
        registration_retries: 2,
        ..Default::default()
    };
    let m = manager_with(&script, config);

    m.connect("abc").await;

    // The hub rejected the method outright; retrying cannot help.
    assert_eq!(script.transport(0).sent().len(), 1);
    assert!(m.is_connected());
}

// ─── Initial-connect backoff ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn initial_failures_back_off_then_give_up() {
    let script = Arc::new(Script::default());
    script.fail_opens.store(u32::MAX, Ordering::SeqCst);
    let m = manager(&script);
    let mut events = m.events();

    m.connect("abc").await;
    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert!(m.has_pending_attempt());

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(script.count(), 5);
    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert!(!m.has_pending_attempt());

    let opened: Vec<Instant> = script
        .transports()
        .iter()
        .map(|t| t.opened_at.lock().unwrap().unwrap())
        .collect();
    let gaps: Vec<u64> = opened
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![2_000, 4_000, 8_000, 16_000]);

    let events = drain(&mut events);
    assert!(events.contains(&ConnectionEvent::RetriesExhausted {
        identity: "abc".into(),
        attempts: 5,
    }));
    let delays: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000]);

    // Nothing else fires afterwards.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(script.count(), 5);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_and_resets_counter() {
    let script = Arc::new(Script::default());
    script.fail_opens.store(2, Ordering::SeqCst);
    let m = manager(&script);

    m.connect("abc").await;
    assert_eq!(m.connect_attempts(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(m.is_connected());
    assert_eq!(script.count(), 3);
    assert_eq!(m.connect_attempts(), 0);
    assert_eq!(script.transport(2).sent(), vec![token("abc")]);
    assert!(!m.has_pending_attempt());
}

#[tokio::test(start_paused = true)]
async fn connect_same_identity_during_pending_retry_is_ignored() {
    let script = Arc::new(Script::default());
    script.fail_opens.store(1, Ordering::SeqCst);
    let m = manager(&script);

    m.connect("abc").await;
    m.connect("abc").await;
    assert_eq!(script.count(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(script.count(), 2);
    assert!(m.is_connected());
}

#[tokio::test(start_paused = true)]
async fn max_connect_attempts_is_configurable() {
    let script = Arc::new(Script::default());
    script.fail_opens.store(u32::MAX, Ordering::SeqCst);
    let config = ManagerConfig {
        max_connect_attempts: 2,
        ..Default::default()
    };
    let m = manager_with(&script, config);

    m.connect("abc").await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(script.count(), 2);
    assert!(!m.has_pending_attempt());
}

// ─── Disconnect ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let script = Arc::new(Script::default());
    script.fail_opens.store(u32::MAX, Ordering::SeqCst);
    let m = manager(&script);

    m.connect("abc").await;
    assert!(m.has_pending_attempt());

    m.disconnect().await;
    assert!(!m.has_pending_attempt());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(script.count(), 1);
    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert_eq!(m.identity(), None);
}

#[tokio::test]
async fn disconnect_releases_and_is_idempotent() {
    let script = Arc::new(Script::default());
    let m = manager(&script);

    m.disconnect().await;
    assert_eq!(m.state(), ConnectionState::Disconnected);

    m.connect("abc").await;
    m.disconnect().await;
    m.disconnect().await;

    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert!(script.transport(0).is_closed());
    assert_eq!(m.identity(), None);
    assert_eq!(m.connect_attempts(), 0);
}

#[tokio::test]
async fn disconnect_while_opening_wins() {
    let script = Arc::new(Script::default());
    let gate = script.gated();
    let m = manager(&script);

    let pending = {
        let m = m.clone();
        tokio::spawn(async move { m.connect("abc").await })
    };
    settle().await;

    m.disconnect().await;
    gate.add_permits(1);
    pending.await.unwrap();
    settle().await;

    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert_eq!(script.live(), 0);
    assert!(script.transport(0).sent().is_empty());
}

// ─── Reconnection ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn native_reconnect_reregisters_same_identity() {
    let script = Arc::new(Script::default());
    script.native_reconnect.store(true, Ordering::SeqCst);
    let m = manager(&script);
    m.connect("abc").await;
    let t = script.transport(0);

    t.emit(TransportEvent::Reconnecting { attempt: 1, reason: Some("reset".into()) });
    settle().await;
    assert_eq!(m.state(), ConnectionState::Reconnecting);
    assert_eq!(m.reconnect_attempts(), 1);

    t.emit(TransportEvent::Reconnected);
    settle().await;

    assert!(m.is_connected());
    assert_eq!(m.reconnect_attempts(), 0);
    assert_eq!(t.sent(), vec![token("abc"), token("abc")]);
    assert_eq!(script.count(), 1);
}

#[tokio::test]
async fn reregistration_does_not_hold_back_events() {
    let script = Arc::new(Script::default());
    script.native_reconnect.store(true, Ordering::SeqCst);
    // The first Token is acknowledged, the one after the reconnect never is.
    *script.stall_sends_after.lock().unwrap() = Some(1);
    let m = manager(&script);
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    m.subscribe(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    m.connect("abc").await;
    let t = script.transport(0);

    t.emit(TransportEvent::Reconnecting { attempt: 1, reason: None });
    t.emit(TransportEvent::Reconnected);
    t.emit(TransportEvent::Message(json!("after-reconnect")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(m.is_connected());
    assert_eq!(t.sent(), vec![token("abc"), token("abc")]);

    t.emit(TransportEvent::Closed(Some("server gone".into())));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn native_reconnect_giving_up_is_terminal() {
    let script = Arc::new(Script::default());
    script.native_reconnect.store(true, Ordering::SeqCst);
    let m = manager(&script);
    let mut events = m.events();
    m.connect("abc").await;
    let t = script.transport(0);

    t.emit(TransportEvent::Reconnecting { attempt: 3, reason: None });
    t.emit(TransportEvent::Closed(Some("retries exhausted".into())));
    settle().await;

    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert!(drain(&mut events).contains(&ConnectionEvent::ReconnectExhausted {
        identity: "abc".into(),
        attempts: 3,
    }));
    assert_eq!(script.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_after_drop_reregisters() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    m.connect("abc").await;

    script.transport(0).emit(TransportEvent::Closed(Some("reset".into())));
    settle().await;
    assert_eq!(m.state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(m.is_connected());
    assert_eq!(script.count(), 2);
    assert!(script.transport(0).is_closed());
    assert_eq!(script.transport(1).sent(), vec![token("abc")]);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_gives_up_after_max() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    let mut events = m.events();
    m.connect("abc").await;

    script.fail_opens.store(u32::MAX, Ordering::SeqCst);
    script.transport(0).emit(TransportEvent::Closed(None));
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert_eq!(script.count(), 6);
    assert!(!m.has_pending_attempt());
    assert!(drain(&mut events).contains(&ConnectionEvent::ReconnectExhausted {
        identity: "abc".into(),
        attempts: 5,
    }));
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_manual_reconnect() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    m.connect("abc").await;

    script.transport(0).emit(TransportEvent::Closed(None));
    settle().await;
    m.disconnect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(script.count(), 1);
    assert_eq!(m.state(), ConnectionState::Disconnected);
}

// ─── Message fan-out ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscriptions_survive_reconnect() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    m.subscribe(move |p| {
        s.lock().unwrap().push(p.clone());
        Ok(())
    });
    m.subscribe(|_| Err("consumer bug".into()));

    m.connect("abc").await;
    script.transport(0).emit(TransportEvent::Message(json!({"n": 1})));
    settle().await;

    script.transport(0).emit(TransportEvent::Closed(None));
    tokio::time::sleep(Duration::from_secs(2)).await;
    script.transport(1).emit(TransportEvent::Message(json!({"n": 2})));
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1}), json!({"n": 2})]);
    assert!(m.is_connected());
}

#[tokio::test]
async fn stale_transport_messages_are_ignored() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    m.subscribe(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    m.connect("A").await;
    let old_tx = script.transport(0).events.lock().unwrap().clone().unwrap();
    m.connect("B").await;

    let _ = old_tx.send(TransportEvent::Message(json!("late")));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    script.transport(1).emit(TransportEvent::Message(json!("fresh")));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_clears_subscriptions() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    m.subscribe(|_| Ok(()));
    m.connect("abc").await;

    m.shutdown().await;

    assert!(m.dispatcher().is_empty());
    assert_eq!(m.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn watch_state_follows_transitions() {
    let script = Arc::new(Script::default());
    let m = manager(&script);
    let rx = m.watch_state();

    m.connect("abc").await;
    assert_eq!(*rx.borrow(), ConnectionState::Connected);

    m.disconnect().await;
    assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
}

#[test]
fn invalid_config_is_rejected() {
    let script = Arc::new(Script::default());
    let s = script.clone();
    let result = ConnectionManager::new(
        ManagerConfig {
            max_connect_attempts: 0,
            ..Default::default()
        },
        move || -> Arc<dyn Transport> { s.create() },
    );
    assert!(result.is_err());
}

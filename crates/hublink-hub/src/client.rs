//! Hub transport with native reconnect.
//!
//! `open()` negotiates, connects and completes the protocol handshake, then
//! hands the socket to a background task. The task owns the link: it sends
//! invocations and matches their completions, pings on an interval, treats
//! server silence as a drop, and re-establishes dropped links with capped
//! exponential backoff while reporting `Reconnecting`/`Reconnected`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hublink_core::endpoint::websocket_url;
use hublink_core::{BackoffPolicy, Transport, TransportError, TransportEvent, TransportEvents};

use crate::config::HubConfig;
use crate::negotiate::negotiate;
use crate::protocol::{handshake_request, parse_frames, parse_handshake_response, HubMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<(), TransportError>>;
type EventTx = mpsc::UnboundedSender<TransportEvent>;

/// Upper bound on waiting for the task to finish a requested close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Command sent from callers to the background hub task.
enum HubCommand {
    Invoke { id: String, frame: String, tx: Reply },
    Close { done: oneshot::Sender<()> },
}

/// A connected, handshaken link.
struct Link {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    /// Frames that arrived in the same message as the handshake answer.
    backlog: Vec<HubMessage>,
}

enum SessionEnd {
    /// `close()` was called or nobody listens to events any more.
    Requested(Option<oneshot::Sender<()>>),
    Dropped { reason: String, allow_reconnect: bool },
}

enum Reconnect {
    Linked(Link),
    Cancelled,
    Exhausted(u32),
}

/// Hub-protocol transport.
pub struct HubTransport {
    config: HubConfig,
    http: reqwest::Client,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<HubCommand>>>,
    next_invocation: AtomicU64,
}

impl HubTransport {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cmd_tx: Mutex::new(None),
            next_invocation: AtomicU64::new(1),
        }
    }

    /// Use a preconfigured HTTP client for the negotiate step.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HubTransport {
    async fn open(&self) -> Result<TransportEvents, TransportError> {
        if self.cmd_tx.lock().unwrap().is_some() {
            return Err(TransportError::Other("hub transport is already open".into()));
        }
        let link = establish(&self.config, &self.http).await?;
        tracing::info!(url = %self.config.url, "hub connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);

        tokio::spawn(hub_task(
            self.config.clone(),
            self.http.clone(),
            link,
            cmd_rx,
            events_tx,
        ));
        Ok(events_rx)
    }

    async fn send(&self, method: &str, payload: Value) -> Result<(), TransportError> {
        let cmd_tx = self
            .cmd_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let id = self.next_invocation.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = HubMessage::Invocation {
            invocation_id: Some(id.clone()),
            target: method.to_string(),
            arguments: vec![payload],
        }
        .to_frame();

        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(HubCommand::Invoke { id, frame, tx })
            .map_err(|_| TransportError::Closed)?;
        match time::timeout(self.config.invocation_timeout(), rx).await {
            Err(_) => Err(TransportError::Timeout {
                ms: self.config.invocation_timeout_ms,
            }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(cmd_tx) = self.cmd_tx.lock().unwrap().take() else {
            return Ok(());
        };
        let (done, closed) = oneshot::channel();
        if cmd_tx.send(HubCommand::Close { done }).is_ok() {
            let _ = time::timeout(CLOSE_TIMEOUT, closed).await;
        }
        Ok(())
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "hub"
    }

    fn url(&self) -> &str {
        &self.config.url
    }
}

// ─── Link establishment ──────────────────────────────────────────────────────

async fn establish(config: &HubConfig, http: &reqwest::Client) -> Result<Link, TransportError> {
    time::timeout(config.handshake_timeout(), connect_and_handshake(config, http))
        .await
        .map_err(|_| TransportError::Timeout {
            ms: config.handshake_timeout_ms,
        })?
}

async fn connect_and_handshake(
    config: &HubConfig,
    http: &reqwest::Client,
) -> Result<Link, TransportError> {
    let url = if config.skip_negotiation {
        websocket_url(&config.url)?
    } else {
        let (mut url, access_token) = negotiate(http, &config.url).await?;
        if let Some(token) = access_token {
            url.query_pairs_mut().append_pair("access_token", &token);
        }
        url
    };
    tracing::debug!(url = %url, "opening hub socket");

    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(handshake_request().into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    loop {
        match stream.next().await {
            None => {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            Some(Ok(Message::Text(text))) => {
                let rest = parse_handshake_response(&text)?;
                let backlog = decode_frames(rest);
                return Ok(Link { sink, stream, backlog });
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(TransportError::Handshake(format!(
                    "server closed during handshake: {}",
                    close_reason(frame)
                )))
            }
            Some(Ok(_)) => continue,
        }
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn hub_task(
    config: HubConfig,
    http: reqwest::Client,
    mut link: Link,
    mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
    events_tx: EventTx,
) {
    let backoff = BackoffPolicy::new(config.backoff);
    let mut pending: HashMap<String, Reply> = HashMap::new();

    loop {
        let end = run_session(&config, &mut link, &mut cmd_rx, &events_tx, &mut pending).await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }

        let reason = match end {
            SessionEnd::Requested(done) => {
                let _ = link.sink.close().await;
                tracing::info!(url = %config.url, "hub connection closed");
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return;
            }
            SessionEnd::Dropped { reason, allow_reconnect: false } => {
                tracing::warn!(url = %config.url, reason = %reason, "hub closed the connection for good");
                let _ = events_tx.send(TransportEvent::Closed(Some(reason)));
                return;
            }
            SessionEnd::Dropped { reason, .. } => reason,
        };

        tracing::warn!(url = %config.url, reason = %reason, "hub connection lost, reconnecting");
        match reconnect(&config, &http, &backoff, &reason, &mut cmd_rx, &events_tx).await {
            Reconnect::Linked(next) => {
                link = next;
                let _ = events_tx.send(TransportEvent::Reconnected);
            }
            Reconnect::Cancelled => return,
            Reconnect::Exhausted(attempts) => {
                tracing::error!(url = %config.url, attempts, "hub reconnect gave up");
                let _ = events_tx.send(TransportEvent::Closed(Some(format!(
                    "gave up reconnecting after {attempts} attempts"
                ))));
                return;
            }
        }
    }
}

async fn run_session(
    config: &HubConfig,
    link: &mut Link,
    cmd_rx: &mut mpsc::UnboundedReceiver<HubCommand>,
    events_tx: &EventTx,
    pending: &mut HashMap<String, Reply>,
) -> SessionEnd {
    for msg in std::mem::take(&mut link.backlog) {
        if let Some(end) = handle_message(msg, config, events_tx, pending) {
            return end;
        }
    }

    let period = config.keepalive_interval();
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = HubMessage::Ping.to_frame();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => return SessionEnd::Requested(None),
                Some(HubCommand::Close { done }) => return SessionEnd::Requested(Some(done)),
                Some(HubCommand::Invoke { id, frame, tx }) => {
                    if let Err(e) = link.sink.send(Message::Text(frame.into())).await {
                        let _ = tx.send(Err(TransportError::WebSocket(e.to_string())));
                        return SessionEnd::Dropped {
                            reason: format!("send failed: {e}"),
                            allow_reconnect: true,
                        };
                    }
                    prune_abandoned(pending);
                    pending.insert(id, tx);
                }
            },
            _ = events_tx.closed() => return SessionEnd::Requested(None),
            _ = keepalive.tick() => {
                prune_abandoned(pending);
                if let Err(e) = link.sink.send(Message::Text(ping.clone().into())).await {
                    return SessionEnd::Dropped {
                        reason: format!("keepalive failed: {e}"),
                        allow_reconnect: true,
                    };
                }
            }
            _ = time::sleep_until(last_seen + config.server_timeout()) => {
                return SessionEnd::Dropped {
                    reason: format!("no message from server within {}ms", config.server_timeout_ms),
                    allow_reconnect: true,
                };
            }
            msg = link.stream.next() => {
                last_seen = Instant::now();
                match msg {
                    None => {
                        return SessionEnd::Dropped {
                            reason: "connection closed".into(),
                            allow_reconnect: true,
                        }
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Dropped {
                            reason: e.to_string(),
                            allow_reconnect: true,
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        for msg in decode_frames(&text) {
                            if let Some(end) = handle_message(msg, config, events_tx, pending) {
                                return end;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = link.sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped {
                            reason: close_reason(frame),
                            allow_reconnect: true,
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn reconnect(
    config: &HubConfig,
    http: &reqwest::Client,
    backoff: &BackoffPolicy,
    reason: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<HubCommand>,
    events_tx: &EventTx,
) -> Reconnect {
    let mut attempt: u32 = 0;
    loop {
        if let Some(max) = config.max_reconnect_attempts {
            if attempt >= max {
                return Reconnect::Exhausted(attempt);
            }
        }
        attempt += 1;
        let delay = backoff.delay(attempt - 1);
        let _ = events_tx.send(TransportEvent::Reconnecting {
            attempt,
            reason: Some(reason.to_string()),
        });
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "hub reconnect scheduled");

        if while_offline(time::sleep(delay), cmd_rx, events_tx).await.is_none() {
            return Reconnect::Cancelled;
        }
        match while_offline(establish(config, http), cmd_rx, events_tx).await {
            None => return Reconnect::Cancelled,
            Some(Ok(link)) => {
                tracing::info!(url = %config.url, attempt, "hub reconnected");
                return Reconnect::Linked(link);
            }
            Some(Err(e)) => {
                tracing::warn!(url = %config.url, attempt, error = %e, "hub reconnect attempt failed");
            }
        }
    }
}

/// Drive `fut` while no link is up. Invocations are refused; a close
/// request (or a dropped event receiver) cancels and yields `None`.
async fn while_offline<F: Future>(
    fut: F,
    cmd_rx: &mut mpsc::UnboundedReceiver<HubCommand>,
    events_tx: &EventTx,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            _ = events_tx.closed() => return None,
            cmd = cmd_rx.recv() => match cmd {
                None => return None,
                Some(HubCommand::Close { done }) => {
                    let _ = done.send(());
                    return None;
                }
                Some(HubCommand::Invoke { tx, .. }) => {
                    let _ = tx.send(Err(TransportError::NotConnected));
                }
            },
        }
    }
}

// ─── Frame handling ──────────────────────────────────────────────────────────

fn decode_frames(text: &str) -> Vec<HubMessage> {
    parse_frames(text)
        .into_iter()
        .filter_map(|frame| match frame {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed hub frame");
                None
            }
        })
        .collect()
}

fn handle_message(
    msg: HubMessage,
    config: &HubConfig,
    events_tx: &EventTx,
    pending: &mut HashMap<String, Reply>,
) -> Option<SessionEnd> {
    match msg {
        HubMessage::Invocation { target, mut arguments, .. } => {
            if target.eq_ignore_ascii_case(&config.message_target) {
                let payload = match arguments.len() {
                    0 => Value::Null,
                    1 => arguments.remove(0),
                    _ => Value::Array(arguments),
                };
                let _ = events_tx.send(TransportEvent::Message(payload));
            } else {
                tracing::debug!(method = %target, "ignoring hub invocation");
            }
            None
        }
        HubMessage::Completion { invocation_id, error, .. } => {
            match pending.remove(&invocation_id) {
                Some(tx) => {
                    let _ = tx.send(match error {
                        Some(message) => Err(TransportError::Hub { message }),
                        None => Ok(()),
                    });
                }
                None => tracing::debug!(invocation_id = %invocation_id, "completion for unknown invocation"),
            }
            None
        }
        HubMessage::Ping => None,
        HubMessage::Close { error, allow_reconnect } => Some(SessionEnd::Dropped {
            reason: error.unwrap_or_else(|| "server closed the connection".into()),
            allow_reconnect,
        }),
        HubMessage::Other(kind) => {
            tracing::debug!(kind, "ignoring hub frame");
            None
        }
    }
}

/// Forget invocations whose caller stopped waiting (its `send` timed out).
fn prune_abandoned(pending: &mut HashMap<String, Reply>) {
    let before = pending.len();
    pending.retain(|_, tx| !tx.is_closed());
    let dropped = before - pending.len();
    if dropped > 0 {
        tracing::debug!(dropped, "forgot abandoned invocations");
    }
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> String {
    match frame {
        Some(f) if !f.reason.is_empty() => f.reason.to_string(),
        Some(f) => format!("closed with code {}", u16::from(f.code)),
        None => "closed without a close frame".into(),
    }
}

//! Plain WebSocket transport.
//!
//! No native reconnect: when the link drops the task reports
//! [`TransportEvent::Closed`] and the connection manager runs its own
//! reconnect loop with a fresh transport.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hublink_core::endpoint::websocket_url;
use hublink_core::{Transport, TransportError, TransportEvent, TransportEvents};

use crate::config::SocketConfig;
use crate::framing;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum SocketCommand {
    Send {
        frame: String,
        tx: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// JSON-over-WebSocket transport.
pub struct SocketTransport {
    config: SocketConfig,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
}

impl SocketTransport {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            cmd_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn open(&self) -> Result<TransportEvents, TransportError> {
        if self.cmd_tx.lock().unwrap().is_some() {
            return Err(TransportError::Other("socket transport is already open".into()));
        }
        let url = websocket_url(&self.config.url)?;
        let (ws, _) = time::timeout(
            self.config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            ms: self.config.connect_timeout_ms,
        })?
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        tracing::info!(url = %url, "socket connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);
        tokio::spawn(socket_task(
            ws,
            self.config.message_event.clone(),
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
        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(SocketCommand::Send {
                frame: framing::encode(method, payload),
                tx,
            })
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(cmd_tx) = self.cmd_tx.lock().unwrap().take() else {
            return Ok(());
        };
        let (done, closed) = oneshot::channel();
        if cmd_tx.send(SocketCommand::Close { done }).is_ok() {
            let _ = time::timeout(CLOSE_TIMEOUT, closed).await;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "socket"
    }

    fn url(&self) -> &str {
        &self.config.url
    }
}

/// Background task that owns the WebSocket.
async fn socket_task(
    ws: WsStream,
    message_event: String,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return;
                }
                Some(SocketCommand::Close { done }) => {
                    let _ = sink.close().await;
                    tracing::info!("socket closed");
                    let _ = done.send(());
                    return;
                }
                Some(SocketCommand::Send { frame, tx }) => {
                    match sink.send(Message::Text(frame.into())).await {
                        Ok(()) => {
                            let _ = tx.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = tx.send(Err(TransportError::WebSocket(e.to_string())));
                            break format!("send failed: {e}");
                        }
                    }
                }
            },
            _ = events_tx.closed() => {
                let _ = sink.close().await;
                return;
            }
            msg = stream.next() => match msg {
                None => break "connection closed".to_string(),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "socket receive error");
                    break e.to_string();
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(payload) = framing::decode(&text, &message_event) {
                        let _ = events_tx.send(TransportEvent::Message(payload));
                    }
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if let Some(payload) = framing::decode(text, &message_event) {
                            let _ = events_tx.send(TransportEvent::Message(payload));
                        }
                    }
                    Err(_) => tracing::debug!(len = data.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "server closed the connection".into());
                }
                Some(Ok(_)) => {}
            },
        }
    };

    tracing::warn!(reason = %reason, "socket connection lost");
    let _ = events_tx.send(TransportEvent::Closed(Some(reason)));
}

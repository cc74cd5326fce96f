//! Hub JSON protocol framing.
//!
//! Every frame is a JSON object terminated by the ASCII record separator
//! (`0x1E`); one WebSocket text message may carry several frames. The
//! `type` field selects the message kind:
//!
//! | type | kind             | handled                                  |
//! |------|------------------|------------------------------------------|
//! | 1    | Invocation       | target + arguments                       |
//! | 3    | Completion       | resolves a pending invocation            |
//! | 6    | Ping             | keepalive only                           |
//! | 7    | Close            | optional error, `allowReconnect`         |
//!
//! Streaming types (2, 4, 5) and anything unknown are surfaced as
//! [`HubMessage::Other`] and ignored by the client.

use serde::Deserialize;
use serde_json::{json, Value};

use hublink_core::TransportError;

/// Frame terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// A decoded hub frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// A frame type the client does not act on.
    Other(u64),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationFrame {
    invocation_id: Option<String>,
    target: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionFrame {
    invocation_id: String,
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseFrame {
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

impl HubMessage {
    /// Encode as a single terminated frame.
    pub fn to_frame(&self) -> String {
        let body = match self {
            Self::Invocation { invocation_id, target, arguments } => {
                let mut v = json!({
                    "type": TYPE_INVOCATION,
                    "target": target,
                    "arguments": arguments,
                });
                if let Some(id) = invocation_id {
                    v["invocationId"] = Value::String(id.clone());
                }
                v
            }
            Self::Completion { invocation_id, result, error } => {
                let mut v = json!({ "type": TYPE_COMPLETION, "invocationId": invocation_id });
                if let Some(result) = result {
                    v["result"] = result.clone();
                }
                if let Some(error) = error {
                    v["error"] = Value::String(error.clone());
                }
                v
            }
            Self::Ping => json!({ "type": TYPE_PING }),
            Self::Close { error, allow_reconnect } => {
                let mut v = json!({ "type": TYPE_CLOSE, "allowReconnect": allow_reconnect });
                if let Some(error) = error {
                    v["error"] = Value::String(error.clone());
                }
                v
            }
            Self::Other(kind) => json!({ "type": kind }),
        };
        let mut frame = body.to_string();
        frame.push(RECORD_SEPARATOR);
        frame
    }

    /// Decode one frame body (without the separator).
    pub fn decode(body: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(body)?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransportError::Other(format!("hub frame without type: {body}")))?;
        Ok(match kind {
            TYPE_INVOCATION => {
                let f: InvocationFrame = serde_json::from_value(value)?;
                Self::Invocation {
                    invocation_id: f.invocation_id,
                    target: f.target,
                    arguments: f.arguments,
                }
            }
            TYPE_COMPLETION => {
                let f: CompletionFrame = serde_json::from_value(value)?;
                Self::Completion {
                    invocation_id: f.invocation_id,
                    result: f.result,
                    error: f.error,
                }
            }
            TYPE_PING => Self::Ping,
            TYPE_CLOSE => {
                let f: CloseFrame = serde_json::from_value(value)?;
                Self::Close {
                    error: f.error,
                    allow_reconnect: f.allow_reconnect,
                }
            }
            other => Self::Other(other),
        })
    }
}

/// Split a text message into frames and decode each. Malformed frames are
/// returned as errors in place so one bad frame does not hide the rest.
pub fn parse_frames(text: &str) -> Vec<Result<HubMessage, TransportError>> {
    text.split(RECORD_SEPARATOR)
        .filter(|body| !body.trim().is_empty())
        .map(HubMessage::decode)
        .collect()
}

/// The first frame a client sends after the socket opens.
pub fn handshake_request() -> String {
    let mut frame = json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION }).to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Check the server's handshake answer. Returns whatever followed the
/// handshake frame in the same message.
pub fn parse_handshake_response(text: &str) -> Result<&str, TransportError> {
    let (body, rest) = text.split_once(RECORD_SEPARATOR).ok_or_else(|| {
        TransportError::Handshake("handshake response is not a complete frame".into())
    })?;
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::Handshake(format!("malformed handshake response: {e}")))?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(TransportError::Handshake(error.to_string()));
    }
    Ok(rest)
}

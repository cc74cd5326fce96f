//! Text framing for the plain socket transport.
//!
//! Inbound text is parsed as JSON and falls back to a JSON string holding
//! the raw text. An object of the form `{"event": <string>, "data": ..}` is
//! an envelope: its `data` is delivered when `event` names the message
//! event, other envelopes are skipped. Outbound sends always use the
//! envelope form with the method as the event name.

use serde_json::{json, Value};

/// Decode one inbound text frame. `None` means "not a notification".
pub fn decode(text: &str, message_event: &str) -> Option<Value> {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(_) => return Some(Value::String(text.to_string())),
    };
    match envelope_event(&value) {
        Some(event) if event == message_event => value.get("data").cloned(),
        Some(event) => {
            tracing::debug!(event, "skipping socket envelope");
            None
        }
        None => Some(value),
    }
}

/// Encode an outbound call.
pub fn encode(method: &str, payload: Value) -> String {
    json!({ "event": method, "data": payload }).to_string()
}

fn envelope_event(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if !obj.contains_key("data") {
        return None;
    }
    obj.get("event")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_passes_through() {
        assert_eq!(decode(r#"{"id":"m1","text":"hi"}"#, "message"), Some(json!({"id": "m1", "text": "hi"})));
        assert_eq!(decode("[1,2]", "message"), Some(json!([1, 2])));
    }

    #[test]
    fn non_json_becomes_string() {
        assert_eq!(decode("hello there", "message"), Some(json!("hello there")));
    }

    #[test]
    fn envelopes_are_unwrapped_or_skipped() {
        assert_eq!(
            decode(r#"{"event":"message","data":{"id":"m1"}}"#, "message"),
            Some(json!({"id": "m1"}))
        );
        assert_eq!(decode(r#"{"event":"system","data":"welcome"}"#, "message"), None);
        // an `event` field without `data` is an ordinary payload
        assert_eq!(
            decode(r#"{"event":"system"}"#, "message"),
            Some(json!({"event": "system"}))
        );
    }

    #[test]
    fn encode_wraps_in_envelope() {
        let v: Value = serde_json::from_str(&encode("Token", json!("abc"))).unwrap();
        assert_eq!(v, json!({"event": "Token", "data": "abc"}));
    }
}

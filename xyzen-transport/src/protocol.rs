//! Xyzen wire protocol: outbound envelopes, close codes, and inbound frame
//! classification.
//!
//! All frames are JSON text. Server-to-client frames carry a `type` tag
//! from the closed [`EventKind`] vocabulary; frames without a tag (or with
//! a tag this client version predates) are legacy direct messages.

use serde_json::{Value, json};

use crate::types::{EventKind, TransportEvent};

/// Application close codes (the 4000–4999 range is reserved for libraries).
pub mod close_code {
    /// Sent when the heartbeat watchdog declares the socket dead.
    pub const HEARTBEAT_TIMEOUT: u16 = 4001;
}

/// Close reason accompanying [`close_code::HEARTBEAT_TIMEOUT`].
pub const HEARTBEAT_TIMEOUT_REASON: &str = "Heartbeat timeout";

/// Terminal status message when the server closed without a reason.
pub(crate) const DEFAULT_CLOSE_ERROR: &str = "Connection closed. Please refresh the page.";

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{"type":"ping"}` — liveness only; answered with a pong, never
    /// forwarded to the application.
    Ping,
    /// A tagged event with a recognized kind.
    Event(TransportEvent),
    /// An untagged (or unrecognized-tag) legacy frame, forwarded raw.
    Legacy(Value),
}

/// Classify an inbound text frame.
///
/// Unknown `type` tags deliberately land in [`Frame::Legacy`]: the event
/// vocabulary is closed and versioned, so an unrecognized tag is a frame
/// this client predates and the raw-message path is the compatible route.
pub fn classify(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let Some(tag) = value.get("type") else {
        return Ok(Frame::Legacy(value));
    };
    match serde_json::from_value::<EventKind>(tag.clone()) {
        Ok(EventKind::Ping) => Ok(Frame::Ping),
        Ok(kind) => {
            let data = value.get("data").cloned().unwrap_or(Value::Null);
            Ok(Frame::Event(TransportEvent { kind, data }))
        }
        Err(_) => Ok(Frame::Legacy(value)),
    }
}

/// `{"message": text}` — the plain chat envelope.
pub fn chat_envelope(text: &str) -> String {
    json!({ "message": text }).to_string()
}

/// `{"type":"pong"}` — heartbeat reply.
pub fn pong_frame() -> String {
    json!({ "type": "pong" }).to_string()
}

/// `{"type":"abort"}` — request cancellation of the in-flight turn.
pub fn abort_frame() -> String {
    json!({ "type": "abort" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ping() {
        assert_eq!(classify(r#"{"type":"ping"}"#).unwrap(), Frame::Ping);
    }

    #[test]
    fn classify_tagged_event() {
        let frame = classify(r#"{"type":"message_chunk","data":{"delta":"hel"}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event(TransportEvent {
                kind: EventKind::MessageChunk,
                data: json!({"delta":"hel"}),
            })
        );
    }

    #[test]
    fn classify_tagged_event_without_data() {
        let frame = classify(r#"{"type":"thinking_end"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event(TransportEvent {
                kind: EventKind::ThinkingEnd,
                data: Value::Null,
            })
        );
    }

    #[test]
    fn classify_untagged_frame_as_legacy() {
        let frame = classify(r#"{"id":"m1","content":"hello"}"#).unwrap();
        assert_eq!(frame, Frame::Legacy(json!({"id":"m1","content":"hello"})));
    }

    #[test]
    fn classify_unknown_tag_as_legacy() {
        // A tag from a newer protocol version falls back to the raw path.
        let frame = classify(r#"{"type":"hologram_start","data":{}}"#).unwrap();
        assert_eq!(frame, Frame::Legacy(json!({"type":"hologram_start","data":{}})));
    }

    #[test]
    fn classify_non_string_tag_as_legacy() {
        let frame = classify(r#"{"type":7,"data":{}}"#).unwrap();
        assert_eq!(frame, Frame::Legacy(json!({"type":7,"data":{}})));
    }

    #[test]
    fn classify_rejects_invalid_json() {
        assert!(classify("not json {").is_err());
    }

    #[test]
    fn chat_envelope_shape() {
        let value: Value = serde_json::from_str(&chat_envelope("hi there")).unwrap();
        assert_eq!(value, json!({"message": "hi there"}));
    }

    #[test]
    fn pong_and_abort_shapes() {
        let pong: Value = serde_json::from_str(&pong_frame()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
        let abort: Value = serde_json::from_str(&abort_frame()).unwrap();
        assert_eq!(abort, json!({"type": "abort"}));
    }
}

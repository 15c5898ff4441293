//! Public types for the xyzen-transport crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// A future resolving to the current bearer token, or `None` when the user
/// is not authenticated.
pub type TokenFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

/// Credential provider: supplies the current bearer token on demand.
///
/// Consulted before every connection attempt, including automatic
/// reconnects, so a rotated token is picked up without intervention.
pub type TokenProvider = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// The closed, versioned vocabulary of tagged server events.
///
/// Frames whose `type` tag is missing or not in this vocabulary are routed
/// to the legacy raw-message path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A complete chat message.
    Message,
    // Streaming lifecycle markers.
    MessageStart,
    MessageChunk,
    MessageEnd,
    // Tool invocation round trip.
    ToolCallRequest,
    ToolCallResponse,
    // Thinking lifecycle markers.
    ThinkingStart,
    ThinkingEnd,
    // Agent execution lifecycle markers.
    AgentStart,
    AgentEnd,
    PhaseStart,
    PhaseEnd,
    NodeStart,
    NodeEnd,
    SubagentStart,
    SubagentEnd,
    // Incremental execution updates.
    Progress,
    Iteration,
    StateUpdate,
    // Account-level signals.
    InsufficientBalance,
    ParallelChatLimit,
    /// Generic server-side error.
    Error,
    /// Topic metadata changed (e.g. auto-generated title).
    TopicUpdated,
    /// The in-flight turn was aborted server-side.
    StreamAborted,
    /// Liveness probe; answered with a pong and never surfaced.
    Ping,
}

/// The typed envelope used for all tagged server-to-client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    /// Discriminant tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Event payload; its shape depends on `kind`.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Events delivered on the channel returned by
/// [`XyzenTransport::connect`](crate::XyzenTransport::connect).
///
/// Data frames may be dropped under backpressure if the consumer falls
/// behind; status events are always delivered.
#[derive(Debug)]
pub enum ClientEvent {
    /// A legacy untagged frame, forwarded raw.
    Message(serde_json::Value),
    /// A tagged event with a recognized kind.
    Event(TransportEvent),
    /// Connection status change. `error` is set only for terminal failures
    /// that require a fresh `connect` to recover from.
    Status {
        /// Whether the socket is currently serving traffic.
        connected: bool,
        /// Human-readable failure reason, terminal failures only.
        error: Option<String>,
    },
    /// The connection reopened after a disconnect. Callers should re-sync
    /// any topic state that may have changed during the gap.
    Reconnected,
}

/// Lifecycle of the primary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No primary connection.
    Idle,
    /// A dial is in flight.
    Connecting,
    /// Socket open and serving traffic.
    Open,
    /// Disconnected; a backoff timer is pending.
    Retrying,
    /// Retries exhausted or authentication lost; a fresh
    /// [`connect`](crate::XyzenTransport::connect) is required.
    Terminal,
}

/// Timing and capacity knobs. Defaults match production behavior; tests
/// tune them down.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Silence window after which the watchdog force-closes the socket.
    pub heartbeat_timeout: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub initial_retry_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub max_retry_delay: Duration,
    /// Automatic reconnect attempts before giving up.
    pub max_retries: u32,
    /// Timeout on a single dial (TCP connect + websocket handshake).
    pub connect_timeout: Duration,
    /// Capacity of the event channels handed to callers.
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(45_000),
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(10_000),
            max_retries: 5,
            connect_timeout: Duration::from_secs(30),
            event_channel_capacity: 64,
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("authentication required: no bearer token available")]
    AuthRequired,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_tags() {
        let cases = [
            (EventKind::Message, "message"),
            (EventKind::MessageChunk, "message_chunk"),
            (EventKind::ToolCallRequest, "tool_call_request"),
            (EventKind::ThinkingStart, "thinking_start"),
            (EventKind::SubagentEnd, "subagent_end"),
            (EventKind::StateUpdate, "state_update"),
            (EventKind::InsufficientBalance, "insufficient_balance"),
            (EventKind::ParallelChatLimit, "parallel_chat_limit"),
            (EventKind::TopicUpdated, "topic_updated"),
            (EventKind::StreamAborted, "stream_aborted"),
            (EventKind::Ping, "ping"),
        ];
        for (kind, tag) in cases {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{tag}\""));
            let parsed: EventKind = serde_json::from_str(&format!("\"{tag}\"")).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_tag_fails_deserialization() {
        let result: Result<EventKind, _> = serde_json::from_str("\"hologram_start\"");
        assert!(result.is_err());
    }

    #[test]
    fn transport_event_round_trip() {
        let json = r#"{"type":"tool_call_request","data":{"tool":"search","args":{"q":"rust"}}}"#;
        let event: TransportEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::ToolCallRequest);
        assert_eq!(event.data, serde_json::json!({"tool":"search","args":{"q":"rust"}}));
    }

    #[test]
    fn transport_event_data_defaults_to_null() {
        let event: TransportEvent = serde_json::from_str(r#"{"type":"stream_aborted"}"#).unwrap();
        assert_eq!(event.kind, EventKind::StreamAborted);
        assert_eq!(event.data, serde_json::Value::Null);
    }

    #[test]
    fn timing_defaults_match_protocol_constants() {
        let timing = TimingConfig::default();
        assert_eq!(timing.heartbeat_timeout, Duration::from_millis(45_000));
        assert_eq!(timing.initial_retry_delay, Duration::from_millis(1_000));
        assert_eq!(timing.max_retry_delay, Duration::from_millis(10_000));
        assert_eq!(timing.max_retries, 5);
    }
}

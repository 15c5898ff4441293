//! The transport client: primary connection ownership and the background
//! connection registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::connection::{
    self, BackgroundEntry, BackgroundRegistry, Command, ConnectionTask, lock_registry,
};
use crate::protocol;
use crate::types::{ClientEvent, ConnectionState, Error, TimingConfig, TokenProvider, TransportEvent};

/// Commands are acknowledged before the next one is issued, so a small
/// buffer is plenty.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Handle to the single primary connection.
struct Primary {
    session_id: String,
    topic_id: String,
    cmd_tx: mpsc::Sender<Command>,
    close_tx: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ConnectionState>,
}

/// The realtime session transport client.
///
/// Owns at most one *primary* connection — the socket bound to the
/// (session, topic) pair the UI currently has focused, with heartbeat
/// watchdog and automatic reconnection — plus a registry of *background*
/// connections detached from primary status, which keep receiving events
/// until they close. Construct one per application and pass it by
/// reference; there is no global instance.
pub struct XyzenTransport {
    base_url: Url,
    get_token: TokenProvider,
    timing: TimingConfig,
    primary: Option<Primary>,
    background: BackgroundRegistry,
}

impl XyzenTransport {
    /// Create a transport client.
    ///
    /// `base_url` is the backend's http(s) origin; the websocket scheme is
    /// derived from it. `get_token` is consulted before every connection
    /// attempt, including automatic reconnects.
    pub fn new(
        base_url: &str,
        get_token: TokenProvider,
        timing: TimingConfig,
    ) -> Result<Self, Error> {
        let base_url = Url::parse(base_url)?;
        if base_url.host_str().is_none() {
            return Err(Error::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            base_url,
            get_token,
            timing,
            primary: None,
            background: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Open (or reuse) the primary connection for a (session, topic) pair.
    ///
    /// Returns `Ok(None)` when an open socket already serves the identical
    /// pair — the call is a no-op and the existing receiver stays valid.
    /// Otherwise any previous primary connection is torn down (with its
    /// pending retry, if any, cancelled), a new socket is opened, and the
    /// event channel for the new connection is returned. The first event
    /// on it is `Status { connected: true }`.
    ///
    /// A successful open always starts with a full retry budget, so an
    /// explicit `connect` revives a pair that previously went terminal.
    pub async fn connect(
        &mut self,
        session_id: &str,
        topic_id: &str,
    ) -> Result<Option<mpsc::Receiver<ClientEvent>>, Error> {
        if let Some(primary) = self.primary.take() {
            let same_pair = primary.session_id == session_id && primary.topic_id == topic_id;
            if same_pair && *primary.state.borrow() == ConnectionState::Open {
                tracing::debug!(
                    session = %session_id,
                    topic = %topic_id,
                    "already connected, ignoring connect"
                );
                self.primary = Some(primary);
                return Ok(None);
            }
            shutdown_primary(primary);
        }

        let (ws_write, ws_read) = connection::dial(
            &self.base_url,
            session_id,
            topic_id,
            &self.get_token,
            &self.timing,
        )
        .await?;
        tracing::info!(session = %session_id, topic = %topic_id, "connected");

        let (event_tx, event_rx) = mpsc::channel(self.timing.event_channel_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let _ = event_tx
            .send(ClientEvent::Status {
                connected: true,
                error: None,
            })
            .await;

        let _ = tokio::spawn(connection::run_connection(
            ConnectionTask {
                ws_write,
                ws_read,
                event_tx,
                cmd_rx,
                state_tx,
                base_url: self.base_url.clone(),
                session_id: session_id.to_string(),
                topic_id: topic_id.to_string(),
                get_token: Arc::clone(&self.get_token),
                timing: self.timing.clone(),
                retry_count: 0,
                dropped_frames: 0,
            },
            close_rx,
        ));

        self.primary = Some(Primary {
            session_id: session_id.to_string(),
            topic_id: topic_id.to_string(),
            cmd_tx,
            close_tx: Some(close_tx),
            state: state_rx,
        });
        Ok(Some(event_rx))
    }

    /// Send a plain chat message as `{"message": text}`.
    ///
    /// Returns `false` (and logs) when the socket is not open — including
    /// while a dial or a retry is in flight. Messages are never queued.
    pub async fn send_message(&self, text: &str) -> bool {
        self.send_frame(protocol::chat_envelope(text)).await
    }

    /// Send an arbitrary JSON-serializable payload. Same liveness contract
    /// as [`send_message`](Self::send_message).
    pub async fn send_structured(&self, payload: &serde_json::Value) -> bool {
        self.send_frame(payload.to_string()).await
    }

    /// Request server-side cancellation of the in-flight agent turn. Same
    /// liveness contract as [`send_message`](Self::send_message).
    pub async fn send_abort(&self) -> bool {
        self.send_frame(protocol::abort_frame()).await
    }

    async fn send_frame(&self, frame: String) -> bool {
        let Some(primary) = &self.primary else {
            tracing::warn!("send attempted with no primary connection");
            return false;
        };
        if *primary.state.borrow() != ConnectionState::Open {
            tracing::warn!("send attempted while socket not open");
            return false;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if primary.cmd_tx.send(Command::Send(frame, ack_tx)).await.is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Detach the primary connection into the background registry under
    /// `topic_id`, so it keeps receiving events after the UI moves on.
    ///
    /// Returns `None` (mutating nothing) when there is no open primary
    /// socket. On success the primary slot is cleared — subsequent sends
    /// return `false` and `connect` will not touch the detached socket —
    /// and the returned channel yields the detached topic's tagged events
    /// until the socket closes. Detach is one-directional: re-attaching
    /// means opening a fresh primary connection.
    pub async fn detach_current_connection(
        &mut self,
        topic_id: &str,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let primary = self.primary.as_ref()?;
        if *primary.state.borrow() != ConnectionState::Open {
            tracing::warn!(topic = %topic_id, "no open primary connection to detach");
            return None;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if primary.cmd_tx.send(Command::Detach(reply_tx)).await.is_err() {
            return None;
        }
        let Ok(Some((ws_write, ws_read))) = reply_rx.await else {
            // The socket died between the liveness check and the handoff.
            return None;
        };

        // The task has already exited its primary role; drop the handle
        // without signalling close.
        self.primary = None;

        let (events_tx, events_rx) = mpsc::channel(self.timing.event_channel_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        if let Some(stale) = lock_registry(&self.background)
            .insert(topic_id.to_string(), BackgroundEntry { close_tx })
        {
            // A previous detach for the same topic is superseded.
            let _ = stale.close_tx.send(());
        }
        tracing::info!(topic = %topic_id, "connection detached to background");

        let _ = tokio::spawn(connection::run_background(
            topic_id.to_string(),
            ws_write,
            ws_read,
            events_tx,
            Arc::clone(&self.background),
            close_rx,
        ));
        Some(events_rx)
    }

    /// Explicitly tear down one background connection. No-op for an
    /// unknown topic.
    pub fn close_background_connection(&mut self, topic_id: &str) {
        let entry = lock_registry(&self.background).remove(topic_id);
        if let Some(entry) = entry {
            tracing::info!(topic = %topic_id, "closing background connection");
            let _ = entry.close_tx.send(());
        }
    }

    /// Terminal teardown: closes the primary socket with retry suppressed
    /// and closes and clears every background entry.
    pub fn disconnect(&mut self) {
        if let Some(primary) = self.primary.take() {
            shutdown_primary(primary);
        }
        let entries: Vec<(String, BackgroundEntry)> = {
            let mut map = lock_registry(&self.background);
            map.drain().collect()
        };
        for (topic, entry) in entries {
            tracing::debug!(topic = %topic, "closing background connection");
            let _ = entry.close_tx.send(());
        }
    }

    /// Current lifecycle state of the primary connection.
    pub fn state(&self) -> ConnectionState {
        self.primary
            .as_ref()
            .map_or(ConnectionState::Idle, |p| *p.state.borrow())
    }

    /// Number of live background connections.
    pub fn background_count(&self) -> usize {
        lock_registry(&self.background).len()
    }
}

impl Drop for XyzenTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn shutdown_primary(mut primary: Primary) {
    // Dropping the command channel alone would still let a pending retry
    // fire; the close signal tears the task down with retry suppressed.
    if let Some(close_tx) = primary.close_tx.take() {
        let _ = close_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> TokenProvider {
        Arc::new(|| Box::pin(async { Some("token".to_string()) }))
    }

    #[test]
    fn rejects_base_url_without_host() {
        let result = XyzenTransport::new("file:///tmp/x", test_provider(), TimingConfig::default());
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn starts_idle_with_empty_registry() {
        let client =
            XyzenTransport::new("https://api.xyzen.dev", test_provider(), TimingConfig::default())
                .unwrap();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(client.background_count(), 0);
    }

    #[tokio::test]
    async fn send_without_connection_returns_false() {
        let client =
            XyzenTransport::new("https://api.xyzen.dev", test_provider(), TimingConfig::default())
                .unwrap();
        assert!(!client.send_message("hello").await);
        assert!(!client.send_structured(&serde_json::json!({"k":"v"})).await);
        assert!(!client.send_abort().await);
    }

    #[tokio::test]
    async fn detach_without_connection_returns_none() {
        let mut client =
            XyzenTransport::new("https://api.xyzen.dev", test_provider(), TimingConfig::default())
                .unwrap();
        assert!(client.detach_current_connection("topic-1").await.is_none());
        assert_eq!(client.background_count(), 0);
    }

    #[test]
    fn close_background_unknown_topic_is_noop() {
        let mut client =
            XyzenTransport::new("https://api.xyzen.dev", test_provider(), TimingConfig::default())
                .unwrap();
        client.close_background_connection("nope");
        assert_eq!(client.background_count(), 0);
    }
}

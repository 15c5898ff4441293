//! Connection lifecycle: the primary event loop, heartbeat watchdog,
//! reconnection controller, and the reduced background loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use url::Url;

use crate::endpoint;
use crate::protocol::{self, DEFAULT_CLOSE_ERROR, Frame, HEARTBEAT_TIMEOUT_REASON, close_code};
use crate::types::{ClientEvent, ConnectionState, Error, TimingConfig, TokenProvider, TransportEvent};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Shared state with the client handle
// ---------------------------------------------------------------------------

/// Commands the client handle sends into the primary connection task.
pub(crate) enum Command {
    /// Write a pre-encoded text frame; the ack reports whether the socket
    /// accepted it (`false` while not open — never queued).
    Send(String, oneshot::Sender<bool>),
    /// Hand the socket halves over for the background lifecycle. Replies
    /// `None` when the socket is not open.
    Detach(DetachReply),
}

pub(crate) type DetachReply = oneshot::Sender<Option<(WsWrite, WsRead)>>;

/// Registry of detached connections, keyed by topic id. Entries are
/// independent: closing one never affects another.
pub(crate) type BackgroundRegistry = Arc<Mutex<HashMap<String, BackgroundEntry>>>;

pub(crate) struct BackgroundEntry {
    pub close_tx: oneshot::Sender<()>,
}

pub(crate) fn lock_registry(
    registry: &BackgroundRegistry,
) -> MutexGuard<'_, HashMap<String, BackgroundEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Fetch a token, build the endpoint, and open a socket.
///
/// Token absence is fatal for the attempt: retrying without a token cannot
/// succeed, so it never participates in backoff.
pub(crate) async fn dial(
    base_url: &Url,
    session_id: &str,
    topic_id: &str,
    get_token: &TokenProvider,
    timing: &TimingConfig,
) -> Result<(WsWrite, WsRead), Error> {
    let token = (get_token)().await.ok_or(Error::AuthRequired)?;
    let url = endpoint::build_ws_url(base_url, session_id, topic_id, &token)?;
    let (ws, _response) = tokio::time::timeout(
        timing.connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| Error::ConnectTimeout)??;
    Ok(ws.split())
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// `min(initial · 2^retry_count, max)` — 1s, 2s, 4s, 8s, 10s (capped) with
/// the default timing.
pub(crate) fn backoff_delay(timing: &TimingConfig, retry_count: u32) -> Duration {
    let exp = retry_count.min(16);
    timing
        .initial_retry_delay
        .saturating_mul(1_u32 << exp)
        .min(timing.max_retry_delay)
}

// ---------------------------------------------------------------------------
// Primary connection task
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionTask {
    pub ws_write: WsWrite,
    pub ws_read: WsRead,
    pub event_tx: mpsc::Sender<ClientEvent>,
    pub cmd_rx: mpsc::Receiver<Command>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub base_url: Url,
    pub session_id: String,
    pub topic_id: String,
    pub get_token: TokenProvider,
    pub timing: TimingConfig,
    pub retry_count: u32,
    pub dropped_frames: u64,
}

impl ConnectionTask {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Dispatch one inbound text frame. Returns `false` when the consumer
    /// has dropped the event channel and the loop should shut down.
    async fn dispatch(&mut self, text: &str) -> bool {
        match protocol::classify(text) {
            Err(e) => {
                // A single bad frame must not tear down a healthy stream.
                tracing::warn!("dropping malformed frame: {e}");
                true
            }
            Ok(Frame::Ping) => {
                tracing::trace!("ping received");
                let pong = tungstenite::Message::Text(protocol::pong_frame().into());
                if let Err(e) = self.ws_write.send(pong).await {
                    // The next read will surface the closure.
                    tracing::warn!("failed to answer ping: {e}");
                }
                true
            }
            Ok(Frame::Event(event)) => self.forward(ClientEvent::Event(event)),
            Ok(Frame::Legacy(value)) => self.forward(ClientEvent::Message(value)),
        }
    }

    /// Non-blocking delivery for data frames: a stalled consumer must not
    /// stall the loop, or heartbeats would be missed and the watchdog would
    /// close a healthy socket. Status events use `send().await` instead.
    fn forward(&mut self, event: ClientEvent) -> bool {
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                tracing::warn!(
                    total_dropped = self.dropped_frames,
                    "event channel full, dropping frame"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// How the inner read loop ended.
enum LoopExit {
    /// The socket died; `Some` carries the server's close reason.
    Disconnected(Option<String>),
    /// The client asked for the socket to move to the background lifecycle.
    Detached(DetachReply),
    /// Commanded teardown, or the consumer went away. No retry.
    Shutdown,
}

/// The primary connection event loop.
///
/// Entered with an already-open socket. Owns the heartbeat watchdog and the
/// reconnection controller; exits on commanded teardown, detach, terminal
/// retry exhaustion, or authentication loss.
pub(crate) async fn run_connection(mut t: ConnectionTask, mut close_rx: oneshot::Receiver<()>) {
    'session: loop {
        t.set_state(ConnectionState::Open);
        let mut last_traffic = Instant::now();

        let exit = loop {
            let deadline = last_traffic + t.timing.heartbeat_timeout;
            tokio::select! {
                frame = t.ws_read.next() => match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        last_traffic = Instant::now();
                        if !t.dispatch(text.as_str()).await {
                            break LoopExit::Shutdown;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::info!(?frame, "server closed connection");
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        break LoopExit::Disconnected(reason);
                    }
                    Some(Ok(_)) => {
                        // Transport-level ping/pong/binary still proves liveness.
                        last_traffic = Instant::now();
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        break LoopExit::Disconnected(None);
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break LoopExit::Disconnected(None);
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        timeout_ms = t.timing.heartbeat_timeout.as_millis() as u64,
                        "heartbeat timeout, force-closing socket"
                    );
                    let close = CloseFrame {
                        code: CloseCode::Library(close_code::HEARTBEAT_TIMEOUT),
                        reason: HEARTBEAT_TIMEOUT_REASON.into(),
                    };
                    let _ = t.ws_write.send(tungstenite::Message::Close(Some(close))).await;
                    break LoopExit::Disconnected(Some(HEARTBEAT_TIMEOUT_REASON.to_string()));
                }

                cmd = t.cmd_rx.recv() => match cmd {
                    Some(Command::Send(frame, ack)) => {
                        let sent = t
                            .ws_write
                            .send(tungstenite::Message::Text(frame.into()))
                            .await
                            .is_ok();
                        if sent {
                            // Outbound traffic counts toward liveness too.
                            last_traffic = Instant::now();
                        }
                        let _ = ack.send(sent);
                        if !sent {
                            tracing::warn!("send failed, treating socket as dead");
                            break LoopExit::Disconnected(None);
                        }
                    }
                    Some(Command::Detach(reply)) => break LoopExit::Detached(reply),
                    None => break LoopExit::Shutdown,
                },

                _ = &mut close_rx => {
                    tracing::info!("close requested");
                    break LoopExit::Shutdown;
                }
            }
        };

        let close_reason = match exit {
            LoopExit::Shutdown => {
                let _ = t.ws_write.send(tungstenite::Message::Close(None)).await;
                t.set_state(ConnectionState::Idle);
                return;
            }
            LoopExit::Detached(reply) => {
                // Primary role ends here; the socket lives on under the
                // background lifecycle. No status is emitted, but the watch
                // must not stay at Open once this task is gone: if the
                // handoff is abandoned the handle would otherwise treat a
                // dead socket as connected forever.
                t.set_state(ConnectionState::Idle);
                let ConnectionTask { ws_write, ws_read, .. } = t;
                let _ = reply.send(Some((ws_write, ws_read)));
                return;
            }
            LoopExit::Disconnected(reason) => reason,
        };

        // Transient status; the retry controller decides what follows.
        let _ = t
            .event_tx
            .send(ClientEvent::Status {
                connected: false,
                error: None,
            })
            .await;

        loop {
            if t.retry_count >= t.timing.max_retries {
                let error = close_reason
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLOSE_ERROR.to_string());
                tracing::error!(retries = t.retry_count, "retries exhausted: {error}");
                t.set_state(ConnectionState::Terminal);
                let _ = t
                    .event_tx
                    .send(ClientEvent::Status {
                        connected: false,
                        error: Some(error),
                    })
                    .await;
                return;
            }

            let delay = backoff_delay(&t.timing, t.retry_count);
            t.retry_count += 1;
            t.set_state(ConnectionState::Retrying);
            tracing::info!(
                attempt = t.retry_count,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );

            let resume_at = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(resume_at) => break,
                    _ = &mut close_rx => {
                        tracing::info!("close requested during backoff");
                        t.set_state(ConnectionState::Idle);
                        return;
                    }
                    cmd = t.cmd_rx.recv() => match cmd {
                        Some(Command::Send(_, ack)) => {
                            // Not open: refuse, never queue.
                            let _ = ack.send(false);
                        }
                        Some(Command::Detach(reply)) => {
                            let _ = reply.send(None);
                        }
                        None => {
                            t.set_state(ConnectionState::Idle);
                            return;
                        }
                    },
                }
            }

            t.set_state(ConnectionState::Connecting);
            match dial(&t.base_url, &t.session_id, &t.topic_id, &t.get_token, &t.timing).await {
                Ok((ws_write, ws_read)) => {
                    t.ws_write = ws_write;
                    t.ws_read = ws_read;
                    t.retry_count = 0;
                    tracing::info!(
                        session = %t.session_id,
                        topic = %t.topic_id,
                        "reconnected"
                    );
                    let _ = t
                        .event_tx
                        .send(ClientEvent::Status {
                            connected: true,
                            error: None,
                        })
                        .await;
                    let _ = t.event_tx.send(ClientEvent::Reconnected).await;
                    continue 'session;
                }
                Err(e @ Error::AuthRequired) => {
                    tracing::error!("bearer token no longer available, giving up");
                    t.set_state(ConnectionState::Terminal);
                    let _ = t
                        .event_tx
                        .send(ClientEvent::Status {
                            connected: false,
                            error: Some(e.to_string()),
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt = t.retry_count, "reconnect attempt failed: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background connection loop
// ---------------------------------------------------------------------------

/// The reduced lifecycle a detached socket runs under: ping→pong auto-reply
/// and tagged-event forwarding only. No watchdog, no retry, no sends;
/// failure is terminal and silent because the UI already moved on.
pub(crate) async fn run_background(
    topic_id: String,
    mut ws_write: WsWrite,
    mut ws_read: WsRead,
    events: mpsc::Sender<TransportEvent>,
    registry: BackgroundRegistry,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut dropped: u64 = 0;
    let explicit = loop {
        tokio::select! {
            frame = ws_read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match protocol::classify(text.as_str()) {
                        Ok(Frame::Ping) => {
                            let pong = tungstenite::Message::Text(protocol::pong_frame().into());
                            if let Err(e) = ws_write.send(pong).await {
                                tracing::debug!(topic = %topic_id, "failed to answer ping: {e}");
                                break false;
                            }
                        }
                        Ok(Frame::Event(event)) => match events.try_send(event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped += 1;
                                tracing::warn!(
                                    topic = %topic_id,
                                    total_dropped = dropped,
                                    "background channel full, dropping event"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break false,
                        },
                        // Untagged frames are only meaningful on the primary path.
                        Ok(Frame::Legacy(_)) => {
                            tracing::trace!(topic = %topic_id, "dropping untagged frame");
                        }
                        Err(e) => {
                            tracing::trace!(topic = %topic_id, "dropping malformed frame: {e}");
                        }
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    tracing::info!(topic = %topic_id, "background connection closed by server");
                    break false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(topic = %topic_id, "background connection error: {e}");
                    break false;
                }
                None => break false,
            },
            _ = &mut close_rx => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                break true;
            }
        }
    };

    // On explicit teardown the closer already removed the entry (and may
    // have replaced it for the same topic), so only natural closes clean up.
    if !explicit {
        let _ = lock_registry(&registry).remove(&topic_id);
    }
    tracing::debug!(topic = %topic_id, "background connection finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        let timing = TimingConfig::default();
        let delays: Vec<u64> = (0..5)
            .map(|n| backoff_delay(&timing, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000]);
    }

    #[test]
    fn backoff_stays_capped_for_large_counts() {
        let timing = TimingConfig::default();
        assert_eq!(backoff_delay(&timing, 30), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(&timing, u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_respects_custom_timing() {
        let timing = TimingConfig {
            initial_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(35),
            ..TimingConfig::default()
        };
        assert_eq!(backoff_delay(&timing, 0), Duration::from_millis(10));
        assert_eq!(backoff_delay(&timing, 1), Duration::from_millis(20));
        assert_eq!(backoff_delay(&timing, 2), Duration::from_millis(35));
    }
}

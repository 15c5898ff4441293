//! Realtime session transport client for the Xyzen backend.
//!
//! Implements the protocol-dense core of the Xyzen UI: a persistent
//! WebSocket that streams chat and agent-execution events for a
//! (session, topic) pair. The transport tolerates unreliable networks,
//! detects half-open sockets with a heartbeat watchdog, reconnects with
//! bounded exponential backoff without losing its (session, topic)
//! context, and lets a still-streaming conversation be detached to the
//! background when the UI's focus moves elsewhere.
//!
//! # Features
//! - Bearer-token authentication (token carried as a query credential)
//! - Typed event dispatch with a legacy raw-message fallback
//! - Heartbeat liveness detection with a forced 4001 close on silence
//! - Automatic reconnection with bounded exponential backoff
//! - Background connection registry for detached topics
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), xyzen_transport::Error> {
//! use std::sync::Arc;
//! use xyzen_transport::{ClientEvent, TimingConfig, XyzenTransport};
//!
//! let mut transport = XyzenTransport::new(
//!     "https://api.example.com",
//!     Arc::new(|| Box::pin(async { Some("bearer-token".to_string()) })),
//!     TimingConfig::default(),
//! )?;
//!
//! if let Some(mut events) = transport.connect("session-1", "topic-1").await? {
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::Event(ev) => println!("event: {:?}", ev.kind),
//!             ClientEvent::Message(raw) => println!("legacy message: {raw}"),
//!             ClientEvent::Status { connected, .. } => println!("connected={connected}"),
//!             ClientEvent::Reconnected => println!("stream resumed, re-sync topic state"),
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod endpoint;
pub mod protocol;
mod types;

pub use client::XyzenTransport;
pub use types::{
    ClientEvent, ConnectionState, Error, EventKind, TimingConfig, TokenFuture, TokenProvider,
    TransportEvent,
};

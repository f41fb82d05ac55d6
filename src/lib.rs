//! Two-party call negotiation core.
//!
//! Signaling envelopes travel through a WebSocket relay ([`relay`]); the
//! [`core::NegotiationCore`] state machine decides what each inbound message
//! means for the call, buffers network candidates that arrive ahead of the
//! session description they depend on, and drives the peer-connection
//! capability through the [`peer`] adapter. Media capture and rendering stay
//! with the host application, which hands in local track handles and listens
//! on the notification channel.
//!
//! Typical wiring:
//!
//! ```no_run
//! use peerlink::{
//!     Command, Config, Event, NegotiationCore, RelayClient, RelayEvent,
//!     WebRtcSessionFactory,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn wire() -> peerlink::Result<()> {
//! let config = Config::default();
//! let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
//! let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
//!
//! // Relay events feed the same loop as everything else.
//! let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<RelayEvent>();
//! let relay = RelayClient::connect(&config.relay_url, relay_tx).await?;
//! let forward = event_tx.clone();
//! tokio::spawn(async move {
//!     while let Some(ev) = relay_rx.recv().await {
//!         if forward.send(ev.into()).is_err() {
//!             break;
//!         }
//!     }
//! });
//!
//! let factory = Arc::new(WebRtcSessionFactory::new(config.ice_servers, vec![])?);
//! let core = NegotiationCore::new(Arc::new(relay), factory, notify_tx, event_tx.clone());
//! tokio::spawn(core.run(event_rx));
//!
//! event_tx.send(Command::CreateRoom("AB12x".into()).into()).ok();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod relay;
pub mod session;
pub mod utils;

pub use config::Config;
pub use self::core::{Command, Event, NegotiationCore, SessionEvent};
pub use envelope::{Envelope, Payload};
pub use error::{Error, Result};
pub use peer::{
    AdapterEvent, IceCandidate, MediaKind, PeerSession, PeerSessionFactory, PeerState,
    RemoteMedia, ServerConfig, WebRtcSessionFactory,
};
pub use relay::{EnvelopeSink, RelayClient, RelayEvent, RelayHandle};
pub use session::{CallSession, NegotiationPhase, Role, RoomId};

//! Relay client: one bidirectional WebSocket channel to the signaling relay.
//! Serializes outbound envelopes, deserializes inbound ones, surfaces channel
//! events. Performs no interpretation of envelope contents.

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

/// Channel-level events, forwarded into the core's event loop.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Open,
    Message(Envelope),
    Error(String),
    Closed,
}

/// Anything outbound envelopes can be handed to. The production impl is
/// [`RelayHandle`]; tests substitute a recorder.
pub trait EnvelopeSink: Send + Sync {
    /// Fire-and-forget, must not block. Fails with
    /// [`Error::ChannelNotReady`] when the channel is down; the envelope is
    /// dropped, there is no retry queue.
    fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// Cloneable handle for sending envelopes through the connected relay.
#[derive(Clone)]
pub struct RelayHandle {
    tx: UnboundedSender<Message>,
}

impl EnvelopeSink for RelayHandle {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::ChannelNotReady)
    }
}

pub struct RelayClient;

impl RelayClient {
    /// Establishes the channel. Expected to be called exactly once per
    /// application lifetime; emits [`RelayEvent::Open`] on success and spawns
    /// the reader and writer tasks.
    pub async fn connect(url: &str, events: UnboundedSender<RelayEvent>) -> Result<RelayHandle> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(%url, "connected to signaling relay");

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            let _ = reader_events.send(RelayEvent::Message(envelope));
                        }
                        Err(e) => warn!(error = %e, "dropping unparseable relay message"),
                    },
                    Ok(Message::Close(_)) => break,
                    // Pings are answered by tungstenite; binary frames are
                    // not part of the envelope contract.
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_events.send(RelayEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            info!("relay channel closed");
            let _ = reader_events.send(RelayEvent::Closed);
        });

        let _ = events.send(RelayEvent::Open);
        Ok(RelayHandle { tx })
    }
}

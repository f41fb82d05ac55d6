//! Façade over the platform peer-connection capability. The negotiation core
//! only ever talks to these traits; the `webrtc`-backed implementation lives
//! in [`super::connection`].

use crate::error::Result;
use crate::peer::types::{IceCandidate, RemoteMedia};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Connectivity of the underlying peer connection, reduced to what the core
/// reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Terminal states end the call session; there is no automatic recovery.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Events the adapter pushes back into the core's event loop.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    LocalCandidate(IceCandidate),
    NegotiationNeeded,
    ConnectionState(PeerState),
    RemoteTrack(RemoteMedia),
}

/// One underlying peer connection, one-to-one with a call session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<RTCSessionDescription>;

    /// Applies the remote offer, then creates an answer and applies it as the
    /// local description.
    async fn create_answer(&self, remote_offer: RTCSessionDescription)
        -> Result<RTCSessionDescription>;

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;

    /// Fails with [`crate::Error::NoRemoteDescription`] if called before a
    /// remote description is applied.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attaches the local media handles (by reference) to the session.
    async fn attach_local_tracks(&self) -> Result<()>;

    async fn local_description(&self) -> Option<RTCSessionDescription>;

    /// Mute is a flag on the attached media, never a renegotiation.
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);

    async fn close(&self);
}

/// Constructs one [`PeerSession`] per call, wired to the given event channel.
#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(&self, events: UnboundedSender<AdapterEvent>) -> Result<Arc<dyn PeerSession>>;
}

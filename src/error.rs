use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("signaling channel not ready")]
    ChannelNotReady,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    #[error("failed to apply remote candidate: {0}")]
    CandidateApplyFailed(String),

    /// Candidate handed to the peer session before a remote description was
    /// set. The core's buffering rule makes this unreachable; seeing it means
    /// a dispatch bug, not a transient condition.
    #[error("no remote description set")]
    NoRemoteDescription,

    #[error("invalid ice server config: {0}")]
    InvalidIceServer(String),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

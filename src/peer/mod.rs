pub mod adapter;
pub mod connection;
pub mod types;

pub use adapter::{AdapterEvent, PeerSession, PeerSessionFactory, PeerState};
pub use connection::{WebRtcPeerSession, WebRtcSessionFactory};
pub use types::{IceCandidate, MediaKind, RemoteMedia, ServerConfig};

//! `webrtc`-backed [`PeerSession`] implementation. One `RTCPeerConnection`
//! per call session, never reused across rooms.

use crate::config::{rtc_configuration, validate_ice_servers};
use crate::error::{Error, Result};
use crate::peer::adapter::{AdapterEvent, PeerSession, PeerSessionFactory, PeerState};
use crate::peer::types::{IceCandidate, MediaKind, RemoteMedia, ServerConfig};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds one peer connection per call from a fixed ICE server list and the
/// local media handles acquired by the host application.
pub struct WebRtcSessionFactory {
    servers: Vec<ServerConfig>,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl WebRtcSessionFactory {
    pub fn new(
        servers: Vec<ServerConfig>,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<Self> {
        validate_ice_servers(&servers)?;
        Ok(Self { servers, tracks })
    }
}

#[async_trait]
impl PeerSessionFactory for WebRtcSessionFactory {
    async fn create(&self, events: UnboundedSender<AdapterEvent>) -> Result<Arc<dyn PeerSession>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(&self.servers))
                .await?,
        );
        wire_callbacks(&pc, events);

        Ok(Arc::new(WebRtcPeerSession {
            pc,
            tracks: self.tracks.clone(),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: UnboundedSender<AdapterEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(AdapterEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!(error = %e, "failed to serialize local candidate"),
            },
            // A null candidate marks the end of gathering.
            None => debug!("local candidate gathering complete"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(AdapterEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(?state, "peer connection state changed");
        let mapped = match state {
            RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            let _ = tx.send(AdapterEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let _ = tx.send(AdapterEvent::RemoteTrack(RemoteMedia {
            id: track.id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl WebRtcPeerSession {
    /// Consulted by the capture glue that feeds samples into the local tracks;
    /// a disabled flag means the writer skips its samples.
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationFailed("local description missing after offer".into()))
    }

    async fn create_answer(
        &self,
        remote_offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        self.pc.set_remote_description(remote_offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationFailed("local description missing after answer".into()))
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            return Err(Error::NoRemoteDescription);
        }
        self.pc
            .add_ice_candidate(candidate.into_init())
            .await
            .map_err(|e| Error::CandidateApplyFailed(e.to_string()))
    }

    async fn attach_local_tracks(&self) -> Result<()> {
        for track in &self.tracks {
            self.pc.add_track(track.clone()).await?;
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error closing peer connection");
        }
    }
}

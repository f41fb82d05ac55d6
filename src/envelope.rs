//! Signaling wire unit. One JSON object per message; which payload field is
//! present is the discriminator, there is no explicit type tag.

use crate::error::{Error, Result};
use crate::peer::types::IceCandidate;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// The envelope exchanged through the relay. Exactly one semantic payload per
/// envelope; `room_id` tags the envelope with the call it belongs to once a
/// session exists (a bare `roomId` envelope is the room-join notification).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<String>,
    /// Marker distinguishing a mute announcement; the state itself is `muted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(rename = "videoStatus", skip_serializing_if = "Option::is_none")]
    pub video_status: Option<bool>,
    #[serde(rename = "roomId", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// Typed view of the single payload carried by an envelope.
#[derive(Debug, Clone)]
pub enum Payload {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(IceCandidate),
    Chat(String),
    Mute(bool),
    VideoStatus(bool),
    RoomJoin(String),
}

impl Envelope {
    pub fn offer(desc: RTCSessionDescription, room: Option<String>) -> Self {
        Self {
            offer: Some(desc),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn answer(desc: RTCSessionDescription, room: Option<String>) -> Self {
        Self {
            answer: Some(desc),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn candidate(candidate: IceCandidate, room: Option<String>) -> Self {
        Self {
            candidate: Some(candidate),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn chat(text: String, room: Option<String>) -> Self {
        Self {
            chat: Some(text),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn mute(muted: bool, room: Option<String>) -> Self {
        Self {
            mute: Some(true),
            muted: Some(muted),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn video_status(enabled: bool, room: Option<String>) -> Self {
        Self {
            video_status: Some(enabled),
            room_id: room,
            ..Default::default()
        }
    }

    pub fn room_join(room: String) -> Self {
        Self {
            room_id: Some(room),
            ..Default::default()
        }
    }

    pub fn room(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Extracts the semantic payload. `None` for an envelope carrying nothing
    /// recognizable, which inbound handling logs and drops.
    pub fn payload(self) -> Option<Payload> {
        if let Some(muted) = self.muted.filter(|_| self.mute.is_some()) {
            Some(Payload::Mute(muted))
        } else if let Some(offer) = self.offer {
            Some(Payload::Offer(offer))
        } else if let Some(answer) = self.answer {
            Some(Payload::Answer(answer))
        } else if let Some(candidate) = self.candidate {
            Some(Payload::Candidate(candidate))
        } else if let Some(chat) = self.chat {
            Some(Payload::Chat(chat))
        } else if let Some(enabled) = self.video_status {
            Some(Payload::VideoStatus(enabled))
        } else {
            self.room_id.map(Payload::RoomJoin)
        }
    }
}

/// Session description with metadata, for the out-of-band copy-paste bootstrap
/// that bypasses the relay entirely.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    pub id: String,
    pub ts: i64,
}

impl SdpPayload {
    pub fn new(sdp: RTCSessionDescription) -> Self {
        Self {
            sdp,
            id: crate::utils::random_id(),
            ts: chrono::Utc::now().timestamp(),
        }
    }
}

pub fn encode_payload(payload: &SdpPayload) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(serde_json::to_string(payload)?))
}

pub fn decode_payload(encoded: &str) -> Result<SdpPayload> {
    let raw = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::MalformedDescription(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| Error::MalformedDescription(e.to_string()))
}

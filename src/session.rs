//! The owned per-call state value. One `CallSession` exists per active call;
//! it is created on the first local action or first inbound offer and dropped
//! on terminal disconnection.

use crate::error::{Error, Result};
use crate::peer::PeerSession;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Validated, non-empty room identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidRoomId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the offer/answer exchange this participant is. Set once at
/// session creation, never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Explicit negotiation phase. A remote description has been applied in
/// `AnswerSent` and `Stable`; that is what decides whether an arriving
/// candidate is applied or buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Stable,
    Disconnected,
}

impl NegotiationPhase {
    pub fn remote_description_set(self) -> bool {
        matches!(self, Self::AnswerSent | Self::Stable)
    }

    pub fn negotiating(self) -> bool {
        matches!(self, Self::OfferSent | Self::OfferReceived | Self::AnswerSent)
    }
}

pub struct CallSession {
    /// `None` only for the manual out-of-band bootstrap, which never touches
    /// the relay and therefore has no room.
    pub room_id: Option<RoomId>,
    pub role: Role,
    pub phase: NegotiationPhase,
    /// Mirror of the peer's last announced mute state; stale until the first
    /// announcement arrives, last value wins.
    pub remote_muted: bool,
    pub remote_video_enabled: bool,
    pub peer: Arc<dyn PeerSession>,
}

impl CallSession {
    pub fn new(room_id: Option<RoomId>, role: Role, peer: Arc<dyn PeerSession>) -> Self {
        Self {
            room_id,
            role,
            phase: NegotiationPhase::Idle,
            remote_muted: false,
            remote_video_enabled: true,
            peer,
        }
    }

    pub fn set_phase(&mut self, phase: NegotiationPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "negotiation phase transition");
            self.phase = phase;
        }
    }

    pub fn room(&self) -> Option<String> {
        self.room_id.as_ref().map(|r| r.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_rejects_blank_input() {
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("   ").is_err());
        assert_eq!(RoomId::new(" AB12x ").unwrap().as_str(), "AB12x");
    }

    #[test]
    fn remote_description_phases() {
        assert!(!NegotiationPhase::Idle.remote_description_set());
        assert!(!NegotiationPhase::OfferSent.remote_description_set());
        assert!(NegotiationPhase::AnswerSent.remote_description_set());
        assert!(NegotiationPhase::Stable.remote_description_set());
        assert!(!NegotiationPhase::Disconnected.remote_description_set());
    }
}

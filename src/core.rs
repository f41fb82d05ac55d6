//! Negotiation core: the per-call state machine. Every external stimulus
//! (a UI command, an inbound envelope, an adapter callback) arrives as one
//! [`Event`] and is processed to completion before the next one.

use crate::envelope::{decode_payload, encode_payload, Envelope, Payload, SdpPayload};
use crate::error::{Error, Result};
use crate::peer::{AdapterEvent, IceCandidate, PeerSession, PeerSessionFactory, PeerState, RemoteMedia};
use crate::relay::{EnvelopeSink, RelayEvent};
use crate::session::{CallSession, NegotiationPhase, Role, RoomId};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Actions the surrounding application can ask of the core.
#[derive(Debug, Clone)]
pub enum Command {
    CreateRoom(String),
    JoinRoom(String),
    ToggleMute,
    ToggleVideo,
    SendChat(String),
    ManualDescription(String),
    HangUp,
}

/// UI-facing notifications. The core never calls back into the application
/// directly; it pushes these onto the notification channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    NegotiationFailed(String),
    Chat(String),
    RemoteMuted(bool),
    RemoteVideoEnabled(bool),
    RemoteTrack(RemoteMedia),
}

/// Everything the core reacts to, merged into one stream.
#[derive(Debug, Clone)]
pub enum Event {
    Relay(RelayEvent),
    Adapter(AdapterEvent),
    Command(Command),
}

impl From<RelayEvent> for Event {
    fn from(ev: RelayEvent) -> Self {
        Self::Relay(ev)
    }
}

impl From<AdapterEvent> for Event {
    fn from(ev: AdapterEvent) -> Self {
        Self::Adapter(ev)
    }
}

impl From<Command> for Event {
    fn from(cmd: Command) -> Self {
        Self::Command(cmd)
    }
}

pub struct NegotiationCore {
    relay: Arc<dyn EnvelopeSink>,
    factory: Arc<dyn PeerSessionFactory>,
    notifications: UnboundedSender<SessionEvent>,
    /// The core's own event stream; adapter events are forwarded into it so
    /// peer-connection callbacks join the same run-to-completion loop.
    events: UnboundedSender<Event>,
    session: Option<CallSession>,
    /// Remote candidates that arrived before a remote description (or before
    /// any session) existed. Append-only until flushed.
    pending_candidates: Vec<IceCandidate>,
    transcript: Vec<String>,
    /// True while a local offer is awaiting its answer. Gates answer handling
    /// so a spurious answer in a settled call is ignored.
    offer_outstanding: bool,
    /// Local intent; kept outside the session so a toggle before the call
    /// starts is reflected onto the tracks once a peer session exists.
    local_muted: bool,
    local_video_enabled: bool,
}

impl NegotiationCore {
    pub fn new(
        relay: Arc<dyn EnvelopeSink>,
        factory: Arc<dyn PeerSessionFactory>,
        notifications: UnboundedSender<SessionEvent>,
        events: UnboundedSender<Event>,
    ) -> Self {
        Self {
            relay,
            factory,
            notifications,
            events,
            session: None,
            pending_candidates: Vec::new(),
            transcript: Vec::new(),
            offer_outstanding: false,
            local_muted: false,
            local_video_enabled: true,
        }
    }

    /// Consumes the event stream until it closes. One call session at a time;
    /// each event runs to completion before the next is taken.
    pub async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
    }

    pub async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(cmd) => self.handle_command(cmd).await,
            Event::Relay(ev) => self.handle_relay(ev).await,
            Event::Adapter(ev) => self.handle_adapter(ev).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        let result = match cmd {
            Command::CreateRoom(room) => self.create_room(&room).await,
            Command::JoinRoom(room) => self.join_room(&room).await,
            Command::ToggleMute => self.toggle_mute().map(|_| ()),
            Command::ToggleVideo => self.toggle_video().map(|_| ()),
            Command::SendChat(text) => self.send_chat(&text),
            Command::ManualDescription(input) => self.manual_description(&input).await,
            Command::HangUp => {
                self.hang_up().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "command failed");
        }
    }

    async fn handle_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open => info!("signaling channel open"),
            RelayEvent::Message(envelope) => self.handle_envelope(envelope).await,
            RelayEvent::Error(e) => warn!(error = %e, "signaling channel error"),
            RelayEvent::Closed => warn!("signaling channel closed"),
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let room_tag = envelope.room().map(str::to_string);
        let Some(payload) = envelope.payload() else {
            warn!("envelope carries no recognizable payload, dropping");
            return;
        };
        match payload {
            Payload::Offer(desc) => {
                let _ = self.handle_offer(desc, room_tag).await;
            }
            Payload::Answer(desc) => {
                let _ = self.handle_answer(desc).await;
            }
            Payload::Candidate(candidate) => self.handle_candidate(candidate).await,
            Payload::Chat(text) => {
                self.transcript.push(text.clone());
                let _ = self.notifications.send(SessionEvent::Chat(text));
            }
            Payload::Mute(muted) => {
                if let Some(session) = self.session.as_mut() {
                    session.remote_muted = muted;
                }
                let _ = self.notifications.send(SessionEvent::RemoteMuted(muted));
            }
            Payload::VideoStatus(enabled) => {
                if let Some(session) = self.session.as_mut() {
                    session.remote_video_enabled = enabled;
                }
                let _ = self
                    .notifications
                    .send(SessionEvent::RemoteVideoEnabled(enabled));
            }
            // Pairing is the relay's concern; nothing to do locally.
            Payload::RoomJoin(room) => info!(%room, "peer joined room"),
        }
    }

    async fn handle_adapter(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::LocalCandidate(candidate) => {
                // The sender always has its own description set; forward
                // immediately, buffering is only a receiving-side concern.
                if let Err(e) = self
                    .relay
                    .send(&Envelope::candidate(candidate, self.session_room()))
                {
                    warn!(error = %e, "dropping local candidate");
                }
            }
            AdapterEvent::NegotiationNeeded => self.negotiation_needed().await,
            AdapterEvent::ConnectionState(state) => self.connection_state(state).await,
            AdapterEvent::RemoteTrack(track) => {
                info!(id = %track.id, kind = ?track.kind, "remote track available");
                let _ = self.notifications.send(SessionEvent::RemoteTrack(track));
            }
        }
    }

    /// Initiates a call as the caller. Fails before any network or adapter
    /// side effect when the room id is invalid; a repeat call for a room that
    /// is already negotiating or stable is a no-op.
    pub async fn create_room(&mut self, room: &str) -> Result<()> {
        let room = RoomId::new(room)?;
        if self.is_active_for(&room) {
            debug!(%room, "already negotiating this room, ignoring");
            return Ok(());
        }
        self.relay.send(&Envelope::room_join(room.to_string()))?;
        if let Err(e) = self.begin_call(Some(room), Role::Caller).await {
            return Err(self.fail_negotiation(e).await);
        }
        if let Err(e) = self.send_offer().await {
            return Err(self.fail_negotiation(e).await);
        }
        if let Some(session) = self.session.as_mut() {
            session.set_phase(NegotiationPhase::OfferSent);
        }
        Ok(())
    }

    /// Joins an existing room as the callee and waits for the offer.
    pub async fn join_room(&mut self, room: &str) -> Result<()> {
        let room = RoomId::new(room)?;
        if self.is_active_for(&room) {
            debug!(%room, "already negotiating this room, ignoring");
            return Ok(());
        }
        self.relay.send(&Envelope::room_join(room.to_string()))?;
        if let Err(e) = self.begin_call(Some(room), Role::Callee).await {
            return Err(self.fail_negotiation(e).await);
        }
        Ok(())
    }

    /// Inbound offer: construct the session if absent, produce and send the
    /// answer, then flush any candidates that were waiting on the remote
    /// description.
    pub async fn handle_offer(
        &mut self,
        desc: RTCSessionDescription,
        room_tag: Option<String>,
    ) -> Result<()> {
        if self.session.is_none() {
            let room = room_tag.and_then(|r| RoomId::new(&r).ok());
            if let Err(e) = self.begin_call(room, Role::Callee).await {
                return Err(self.fail_negotiation(e).await);
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.set_phase(NegotiationPhase::OfferReceived);
        }
        let Some(peer) = self.peer() else {
            return Err(self
                .fail_negotiation(Error::NegotiationFailed("no peer session".into()))
                .await);
        };
        let answer = match peer.create_answer(desc).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(e).await),
        };
        if let Err(e) = self.relay.send(&Envelope::answer(answer, self.session_room())) {
            if self.session_room().is_some() {
                return Err(self.fail_negotiation(e).await);
            }
            // A room-less session comes from the manual bootstrap, which
            // bypasses the relay; the answer travels back out of band via
            // export_local_description.
            warn!(error = %e, "relay unavailable, answer must be exported out of band");
        }
        if let Some(session) = self.session.as_mut() {
            session.set_phase(NegotiationPhase::AnswerSent);
        }
        self.flush_pending(&peer).await;
        Ok(())
    }

    /// Inbound answer: only meaningful on the caller side after an offer went
    /// out; anything else is a logged anomaly, not an error.
    pub async fn handle_answer(&mut self, desc: RTCSessionDescription) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            warn!("answer with no active session, ignoring");
            return Ok(());
        };
        if session.role != Role::Caller || !self.offer_outstanding {
            warn!(role = ?session.role, phase = ?session.phase, "unexpected answer, ignoring");
            return Ok(());
        }
        let peer = session.peer.clone();
        if let Err(e) = peer.set_remote_description(desc).await {
            return Err(self.fail_negotiation(e).await);
        }
        self.offer_outstanding = false;
        if let Some(session) = self.session.as_mut() {
            session.set_phase(NegotiationPhase::Stable);
        }
        self.flush_pending(&peer).await;
        Ok(())
    }

    /// Inbound candidate. Applied immediately only once a remote description
    /// exists; a candidate must never reach the peer session before that, so
    /// everything earlier is buffered.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        let applicable = self
            .session
            .as_ref()
            .map(|s| s.phase.remote_description_set())
            .unwrap_or(false);
        if !applicable {
            debug!("remote description not set, buffering candidate");
            self.pending_candidates.push(candidate);
            return;
        }
        if let Some(peer) = self.peer() {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                // Per-candidate failures lose one path, not the call.
                warn!(error = %e, "failed to apply remote candidate");
            }
        }
    }

    /// Renegotiation trigger from the adapter: always produce a fresh offer.
    async fn negotiation_needed(&mut self) {
        if self.session.is_none() {
            warn!("negotiation-needed with no session, ignoring");
            return;
        }
        match self.send_offer().await {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    if session.phase == NegotiationPhase::Idle {
                        session.set_phase(NegotiationPhase::OfferSent);
                    }
                }
            }
            Err(e) => {
                let _ = self.fail_negotiation(e).await;
            }
        }
    }

    async fn connection_state(&mut self, state: PeerState) {
        match state {
            PeerState::Connected => {
                info!("peer connection established");
                let _ = self.notifications.send(SessionEvent::Connected);
            }
            s if s.is_terminal() => {
                info!(state = ?s, "peer connection ended, releasing session");
                self.teardown().await;
                let _ = self.notifications.send(SessionEvent::Disconnected);
            }
            _ => {}
        }
    }

    /// Local flag flip plus an announcement to the peer. Never touches the
    /// negotiation phase; valid in any phase including before a session.
    pub fn toggle_mute(&mut self) -> Result<bool> {
        self.local_muted = !self.local_muted;
        if let Some(session) = &self.session {
            session.peer.set_audio_enabled(!self.local_muted);
        }
        self.relay
            .send(&Envelope::mute(self.local_muted, self.session_room()))?;
        Ok(self.local_muted)
    }

    pub fn toggle_video(&mut self) -> Result<bool> {
        self.local_video_enabled = !self.local_video_enabled;
        if let Some(session) = &self.session {
            session.peer.set_video_enabled(self.local_video_enabled);
        }
        self.relay.send(&Envelope::video_status(
            self.local_video_enabled,
            self.session_room(),
        ))?;
        Ok(self.local_video_enabled)
    }

    /// Fire-and-forget chat. A trimmed-empty message is a complete no-op.
    pub fn send_chat(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.relay
            .send(&Envelope::chat(text.to_string(), self.session_room()))?;
        self.transcript.push(text.to_string());
        Ok(())
    }

    /// Out-of-band bootstrap: accepts a raw description JSON or an encoded
    /// [`SdpPayload`], which must be a well-formed offer. On success this is
    /// exactly an inbound offer; on any shape or parse failure nothing
    /// changes.
    pub async fn manual_description(&mut self, input: &str) -> Result<()> {
        let desc = parse_manual_description(input)?;
        self.handle_offer(desc, None).await
    }

    /// The outbound half of the manual bootstrap: the current local
    /// description as an encoded payload for copy-paste exchange.
    pub async fn export_local_description(&self) -> Result<String> {
        let peer = self
            .peer()
            .ok_or_else(|| Error::NegotiationFailed("no active session".into()))?;
        let desc = peer
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationFailed("no local description yet".into()))?;
        encode_payload(&SdpPayload::new(desc))
    }

    /// Explicit local teardown, identical to a terminal disconnection.
    pub async fn hang_up(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.teardown().await;
        let _ = self.notifications.send(SessionEvent::Disconnected);
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn local_muted(&self) -> bool {
        self.local_muted
    }

    pub fn local_video_enabled(&self) -> bool {
        self.local_video_enabled
    }

    fn is_active_for(&self, room: &RoomId) -> bool {
        self.session.as_ref().is_some_and(|s| {
            s.room_id.as_ref() == Some(room)
                && (s.phase.negotiating() || s.phase == NegotiationPhase::Stable)
        })
    }

    fn peer(&self) -> Option<Arc<dyn PeerSession>> {
        self.session.as_ref().map(|s| s.peer.clone())
    }

    fn session_room(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.room())
    }

    /// Constructs the peer session, attaches the local media and reflects the
    /// pre-call mute/video intent onto it.
    async fn begin_call(&mut self, room: Option<RoomId>, role: Role) -> Result<()> {
        // Starting over replaces any previous call outright; its buffered
        // candidates belong to the old peer connection.
        if let Some(mut old) = self.session.take() {
            old.set_phase(NegotiationPhase::Disconnected);
            old.peer.close().await;
            self.pending_candidates.clear();
            self.offer_outstanding = false;
        }
        let peer = self.factory.create(self.adapter_sender()).await?;
        peer.attach_local_tracks().await?;
        peer.set_audio_enabled(!self.local_muted);
        peer.set_video_enabled(self.local_video_enabled);
        info!(room = ?room.as_ref().map(RoomId::as_str), ?role, "call session created");
        self.session = Some(CallSession::new(room, role, peer));
        Ok(())
    }

    /// Produces a local offer and hands it to the relay. Callers decide what
    /// a failure means for the session.
    async fn send_offer(&mut self) -> Result<()> {
        let peer = self
            .peer()
            .ok_or_else(|| Error::NegotiationFailed("no peer session".into()))?;
        let offer = peer.create_offer().await?;
        self.relay.send(&Envelope::offer(offer, self.session_room()))?;
        self.offer_outstanding = true;
        Ok(())
    }

    /// Bridges adapter callbacks into the core's own event stream so they are
    /// processed by the same single-threaded loop.
    fn adapter_sender(&self) -> UnboundedSender<AdapterEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(Event::Adapter(event)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Applies every buffered candidate in arrival order. One candidate
    /// failing does not stop the rest; failures are logged, not surfaced.
    async fn flush_pending(&mut self, peer: &Arc<dyn PeerSession>) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let drained: Vec<IceCandidate> = self.pending_candidates.drain(..).collect();
        info!(count = drained.len(), "applying buffered remote candidates");
        for candidate in drained {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                warn!(error = %e, "buffered candidate failed to apply, continuing");
            }
        }
    }

    /// Offer/answer failures end the session; they are surfaced once and
    /// never retried.
    async fn fail_negotiation(&mut self, cause: Error) -> Error {
        error!(error = %cause, "negotiation failed, ending session");
        self.teardown().await;
        let _ = self
            .notifications
            .send(SessionEvent::NegotiationFailed(cause.to_string()));
        cause
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.set_phase(NegotiationPhase::Disconnected);
            session.peer.close().await;
        }
        self.pending_candidates.clear();
        self.offer_outstanding = false;
    }
}

fn parse_manual_description(input: &str) -> Result<RTCSessionDescription> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::MalformedDescription("empty input".into()));
    }
    let desc: RTCSessionDescription = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| Error::MalformedDescription(e.to_string()))?
    } else {
        decode_payload(trimmed)?.sdp
    };
    if desc.sdp_type != RTCSdpType::Offer {
        return Err(Error::MalformedDescription(format!(
            "expected an offer, got {:?}",
            desc.sdp_type
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(Error::MalformedDescription("empty sdp".into()));
    }
    RTCSessionDescription::offer(desc.sdp).map_err(|e| Error::MalformedDescription(e.to_string()))
}

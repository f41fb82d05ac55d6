//! Negotiation core behavior against a recording mock adapter and sink.

use peerlink::{
    AdapterEvent, Command, Envelope, Error, Event, IceCandidate, NegotiationCore,
    NegotiationPhase, Payload, PeerSession, PeerSessionFactory, RelayEvent, Role, SessionEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

fn offer() -> RTCSessionDescription {
    RTCSessionDescription::offer(OFFER_SDP.to_string()).unwrap()
}

fn answer() -> RTCSessionDescription {
    RTCSessionDescription::answer(ANSWER_SDP.to_string()).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerCall {
    AttachTracks,
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription,
    AddCandidate(String),
    SetAudio(bool),
    SetVideo(bool),
    Close,
}

/// Recording stand-in for the webrtc-backed session. Candidates whose string
/// contains "bad" fail to apply, mimicking a rejected network path.
struct MockPeer {
    calls: Mutex<Vec<PeerCall>>,
    remote_description_set: AtomicBool,
}

impl MockPeer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    fn candidate_attempts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PeerCall::AddCandidate(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl PeerSession for MockPeer {
    async fn create_offer(&self) -> peerlink::Result<RTCSessionDescription> {
        self.record(PeerCall::CreateOffer);
        Ok(offer())
    }

    async fn create_answer(
        &self,
        _remote_offer: RTCSessionDescription,
    ) -> peerlink::Result<RTCSessionDescription> {
        self.record(PeerCall::CreateAnswer);
        self.remote_description_set.store(true, Ordering::SeqCst);
        Ok(answer())
    }

    async fn set_remote_description(&self, _desc: RTCSessionDescription) -> peerlink::Result<()> {
        self.record(PeerCall::SetRemoteDescription);
        self.remote_description_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> peerlink::Result<()> {
        self.record(PeerCall::AddCandidate(candidate.candidate.clone()));
        if !self.remote_description_set.load(Ordering::SeqCst) {
            return Err(Error::NoRemoteDescription);
        }
        if candidate.candidate.contains("bad") {
            return Err(Error::CandidateApplyFailed(candidate.candidate));
        }
        Ok(())
    }

    async fn attach_local_tracks(&self) -> peerlink::Result<()> {
        self.record(PeerCall::AttachTracks);
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        Some(offer())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.record(PeerCall::SetAudio(enabled));
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.record(PeerCall::SetVideo(enabled));
    }

    async fn close(&self) {
        self.record(PeerCall::Close);
    }
}

#[derive(Default)]
struct MockFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockFactory {
    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn last_peer(&self) -> Arc<MockPeer> {
        self.created.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PeerSessionFactory for MockFactory {
    async fn create(
        &self,
        _events: UnboundedSender<AdapterEvent>,
    ) -> peerlink::Result<Arc<dyn PeerSession>> {
        let peer = MockPeer::new();
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

struct MockSink {
    sent: Mutex<Vec<Envelope>>,
    ready: AtomicBool,
}

impl MockSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
        })
    }

    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl peerlink::EnvelopeSink for MockSink {
    fn send(&self, envelope: &Envelope) -> peerlink::Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::ChannelNotReady);
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

struct Harness {
    core: NegotiationCore,
    sink: Arc<MockSink>,
    factory: Arc<MockFactory>,
    notifications: UnboundedReceiver<SessionEvent>,
    // Kept alive so adapter forwarding tasks have a live receiver.
    _events: UnboundedReceiver<Event>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let sink = MockSink::new();
    let factory = Arc::new(MockFactory::default());
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let core = NegotiationCore::new(sink.clone(), factory.clone(), notify_tx, event_tx);
    Harness {
        core,
        sink,
        factory,
        notifications: notify_rx,
        _events: event_rx,
    }
}

#[tokio::test]
async fn empty_room_id_fails_before_any_side_effect() {
    let mut h = harness();
    for input in ["", "   "] {
        assert!(matches!(
            h.core.create_room(input).await,
            Err(Error::InvalidRoomId(_))
        ));
        assert!(matches!(
            h.core.join_room(input).await,
            Err(Error::InvalidRoomId(_))
        ));
    }
    assert!(h.sink.sent().is_empty());
    assert_eq!(h.factory.created_count(), 0);
    assert!(h.core.session().is_none());
}

#[tokio::test]
async fn create_room_sends_room_join_then_offer() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();

    let sent = h.sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        sent[0].clone().payload(),
        Some(Payload::RoomJoin(room)) if room == "AB12x"
    ));
    assert_eq!(sent[1].room(), Some("AB12x"));
    assert!(matches!(sent[1].clone().payload(), Some(Payload::Offer(_))));

    let session = h.core.session().unwrap();
    assert_eq!(session.role, Role::Caller);
    assert_eq!(session.phase, NegotiationPhase::OfferSent);

    // Tracks go in before the offer is generated, intent flags applied.
    let calls = h.factory.last_peer().calls();
    let attach = calls.iter().position(|c| *c == PeerCall::AttachTracks).unwrap();
    let create = calls.iter().position(|c| *c == PeerCall::CreateOffer).unwrap();
    assert!(attach < create);
    assert!(calls.contains(&PeerCall::SetAudio(true)));
    assert!(calls.contains(&PeerCall::SetVideo(true)));
}

#[tokio::test]
async fn create_room_is_idempotent_while_negotiating() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();
    let sent_before = h.sink.sent().len();

    h.core.create_room("AB12x").await.unwrap();
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.sink.sent().len(), sent_before);
}

#[tokio::test]
async fn candidates_before_remote_description_are_buffered() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();

    h.core.handle_candidate(IceCandidate::new("cand-0")).await;
    h.core.handle_candidate(IceCandidate::new("cand-1")).await;

    assert_eq!(h.core.pending_candidates().len(), 2);
    assert!(h.factory.last_peer().candidate_attempts().is_empty());
    assert_eq!(h.core.session().unwrap().phase, NegotiationPhase::OfferSent);
}

#[tokio::test]
async fn answer_flushes_buffer_in_order_despite_failures() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();

    h.core.handle_candidate(IceCandidate::new("bad-cand")).await;
    h.core.handle_candidate(IceCandidate::new("cand-1")).await;
    h.core.handle_candidate(IceCandidate::new("cand-2")).await;

    h.core.handle_answer(answer()).await.unwrap();

    assert_eq!(h.core.session().unwrap().phase, NegotiationPhase::Stable);
    assert!(h.core.pending_candidates().is_empty());
    // The failing candidate is attempted and skipped, not fatal.
    assert_eq!(
        h.factory.last_peer().candidate_attempts(),
        vec!["bad-cand", "cand-1", "cand-2"]
    );
}

#[tokio::test]
async fn candidate_applies_immediately_once_stable() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();
    h.core.handle_answer(answer()).await.unwrap();

    h.core.handle_candidate(IceCandidate::new("late-cand")).await;

    assert!(h.core.pending_candidates().is_empty());
    assert_eq!(h.factory.last_peer().candidate_attempts(), vec!["late-cand"]);
}

#[tokio::test]
async fn answer_is_ignored_unless_caller_with_offer_out() {
    let mut h = harness();

    // No session at all: anomaly, not an error.
    h.core.handle_answer(answer()).await.unwrap();
    assert!(h.core.session().is_none());

    // Callee waiting for an offer must not apply an answer.
    h.core.join_room("AB12x").await.unwrap();
    h.core.handle_answer(answer()).await.unwrap();

    let peer = h.factory.last_peer();
    assert!(!peer.calls().contains(&PeerCall::SetRemoteDescription));
    assert_eq!(h.core.session().unwrap().phase, NegotiationPhase::Idle);
}

#[tokio::test]
async fn inbound_offer_reuses_joined_session_and_answers() {
    let mut h = harness();
    h.core.join_room("AB12x").await.unwrap();

    h.core
        .handle(Event::Relay(RelayEvent::Message(Envelope::offer(
            offer(),
            Some("AB12x".into()),
        ))))
        .await;

    assert_eq!(h.factory.created_count(), 1);
    let session = h.core.session().unwrap();
    assert_eq!(session.role, Role::Callee);
    assert_eq!(session.phase, NegotiationPhase::AnswerSent);

    let sent = h.sink.sent();
    let last = sent.last().unwrap().clone();
    assert_eq!(last.room(), Some("AB12x"));
    assert!(matches!(last.payload(), Some(Payload::Answer(_))));
    assert!(h.core.pending_candidates().is_empty());
}

#[tokio::test]
async fn inbound_offer_without_session_creates_callee_session() {
    let mut h = harness();
    h.core
        .handle_offer(offer(), Some("XYZ".into()))
        .await
        .unwrap();

    assert_eq!(h.factory.created_count(), 1);
    let session = h.core.session().unwrap();
    assert_eq!(session.role, Role::Callee);
    assert_eq!(session.room_id.as_ref().unwrap().as_str(), "XYZ");
    let calls = h.factory.last_peer().calls();
    assert!(calls.contains(&PeerCall::AttachTracks));
    assert!(calls.contains(&PeerCall::CreateAnswer));
}

#[tokio::test]
async fn candidate_with_no_session_is_buffered_untouched() {
    let mut h = harness();
    h.core.handle_candidate(IceCandidate::new("early")).await;

    assert_eq!(h.core.pending_candidates().len(), 1);
    assert_eq!(h.factory.created_count(), 0);
    assert!(h.core.session().is_none());
}

#[tokio::test]
async fn mute_toggle_round_trips_with_two_announcements() {
    let mut h = harness();
    assert!(h.core.toggle_mute().unwrap());
    assert!(!h.core.toggle_mute().unwrap());
    assert!(!h.core.local_muted());

    let announcements: Vec<bool> = h
        .sink
        .sent()
        .into_iter()
        .filter_map(|env| match env.payload() {
            Some(Payload::Mute(muted)) => Some(muted),
            _ => None,
        })
        .collect();
    assert_eq!(announcements, vec![true, false]);
}

#[tokio::test]
async fn video_toggle_reaches_tracks_once_session_exists() {
    let mut h = harness();
    h.core.toggle_video().unwrap(); // pre-call intent: video off
    h.core.create_room("AB12x").await.unwrap();

    assert!(h
        .factory
        .last_peer()
        .calls()
        .contains(&PeerCall::SetVideo(false)));

    h.core.toggle_video().unwrap();
    assert!(h
        .factory
        .last_peer()
        .calls()
        .contains(&PeerCall::SetVideo(true)));
}

#[tokio::test]
async fn blank_chat_produces_no_envelope_and_no_transcript() {
    let mut h = harness();
    h.core.send_chat("").unwrap();
    h.core.send_chat("   \t").unwrap();

    assert!(h.sink.sent().is_empty());
    assert!(h.core.transcript().is_empty());

    h.core.send_chat("hello").unwrap();
    assert_eq!(h.core.transcript(), &["hello".to_string()]);
    assert!(matches!(
        h.sink.sent()[0].clone().payload(),
        Some(Payload::Chat(m)) if m == "hello"
    ));
}

#[tokio::test]
async fn toggle_surfaces_channel_not_ready_synchronously() {
    let mut h = harness();
    h.sink.ready.store(false, Ordering::SeqCst);
    assert!(matches!(h.core.toggle_mute(), Err(Error::ChannelNotReady)));
}

#[tokio::test]
async fn inbound_chat_and_status_updates_are_surfaced() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();

    h.core
        .handle(Event::Relay(RelayEvent::Message(Envelope::chat(
            "hi there".into(),
            Some("AB12x".into()),
        ))))
        .await;
    h.core
        .handle(Event::Relay(RelayEvent::Message(Envelope::mute(
            true,
            Some("AB12x".into()),
        ))))
        .await;
    h.core
        .handle(Event::Relay(RelayEvent::Message(Envelope::video_status(
            false,
            Some("AB12x".into()),
        ))))
        .await;

    assert_eq!(h.core.transcript(), &["hi there".to_string()]);
    let session = h.core.session().unwrap();
    assert!(session.remote_muted);
    assert!(!session.remote_video_enabled);

    assert!(matches!(
        h.notifications.try_recv(),
        Ok(SessionEvent::Chat(m)) if m == "hi there"
    ));
    assert!(matches!(
        h.notifications.try_recv(),
        Ok(SessionEvent::RemoteMuted(true))
    ));
    assert!(matches!(
        h.notifications.try_recv(),
        Ok(SessionEvent::RemoteVideoEnabled(false))
    ));
}

#[tokio::test]
async fn local_candidates_are_forwarded_immediately() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();

    h.core
        .handle(Event::Adapter(AdapterEvent::LocalCandidate(
            IceCandidate::new("local-0"),
        )))
        .await;

    let last = h.sink.sent().last().unwrap().clone();
    assert_eq!(last.room(), Some("AB12x"));
    assert!(matches!(
        last.payload(),
        Some(Payload::Candidate(c)) if c.candidate == "local-0"
    ));
}

#[tokio::test]
async fn terminal_peer_state_destroys_the_session() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();
    h.core.handle_candidate(IceCandidate::new("cand-0")).await;

    h.core
        .handle(Event::Adapter(AdapterEvent::ConnectionState(
            peerlink::PeerState::Failed,
        )))
        .await;

    assert!(h.core.session().is_none());
    assert!(h.core.pending_candidates().is_empty());
    assert!(h.factory.last_peer().calls().contains(&PeerCall::Close));
    assert!(matches!(
        h.notifications.try_recv(),
        Ok(SessionEvent::Disconnected)
    ));
}

#[tokio::test]
async fn malformed_manual_description_changes_nothing() {
    let mut h = harness();
    let err = h
        .core
        .manual_description(r#"{"type":"offer"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));
    assert_eq!(h.factory.created_count(), 0);
    assert!(h.core.session().is_none());

    let err = h.core.manual_description("").await.unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));
}

#[tokio::test]
async fn manual_offer_behaves_like_inbound_offer() {
    let mut h = harness();
    let input = format!(
        r#"{{"type":"offer","sdp":"{}"}}"#,
        OFFER_SDP.replace("\r\n", "\\r\\n")
    );
    h.core.manual_description(&input).await.unwrap();

    let session = h.core.session().unwrap();
    assert_eq!(session.role, Role::Callee);
    assert_eq!(session.phase, NegotiationPhase::AnswerSent);
    assert!(session.room_id.is_none());
}

#[tokio::test]
async fn two_party_scenario_end_to_end() {
    let mut a = harness();
    let mut b = harness();

    // A creates the room: room-join then offer go out.
    a.core.create_room("AB12x").await.unwrap();
    let offer_env = a.sink.sent()[1].clone();

    // B joins and receives A's offer through the relay path.
    b.core.join_room("AB12x").await.unwrap();
    b.core
        .handle(Event::Relay(RelayEvent::Message(offer_env)))
        .await;
    assert_eq!(b.core.session().unwrap().phase, NegotiationPhase::AnswerSent);
    let answer_env = b.sink.sent().last().unwrap().clone();

    // Two of B's candidates outrun the answer; A buffers them.
    a.core.handle_candidate(IceCandidate::new("b-cand-0")).await;
    a.core.handle_candidate(IceCandidate::new("b-cand-1")).await;
    assert_eq!(a.core.pending_candidates().len(), 2);

    // The answer lands: remote description applied, buffer drained in order.
    a.core
        .handle(Event::Relay(RelayEvent::Message(answer_env)))
        .await;
    assert_eq!(a.core.session().unwrap().phase, NegotiationPhase::Stable);
    assert!(a.core.pending_candidates().is_empty());
    assert_eq!(
        a.factory.last_peer().candidate_attempts(),
        vec!["b-cand-0", "b-cand-1"]
    );
}

#[tokio::test]
async fn renegotiation_request_sends_a_fresh_offer() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();
    h.core.handle_answer(answer()).await.unwrap();
    let sent_before = h.sink.sent().len();

    h.core
        .handle(Event::Adapter(AdapterEvent::NegotiationNeeded))
        .await;

    let sent = h.sink.sent();
    assert_eq!(sent.len(), sent_before + 1);
    assert!(matches!(
        sent.last().unwrap().clone().payload(),
        Some(Payload::Offer(_))
    ));
    // Renegotiation from an established call does not regress the phase.
    assert_eq!(h.core.session().unwrap().phase, NegotiationPhase::Stable);
}

#[tokio::test]
async fn manual_bootstrap_survives_relay_outage() {
    let mut h = harness();
    h.sink.ready.store(false, Ordering::SeqCst);

    let input = format!(
        r#"{{"type":"offer","sdp":"{}"}}"#,
        OFFER_SDP.replace("\r\n", "\\r\\n")
    );
    h.core.manual_description(&input).await.unwrap();

    // The relay being down is expected here; the answer leaves via export.
    let session = h.core.session().unwrap();
    assert_eq!(session.role, Role::Callee);
    assert_eq!(session.phase, NegotiationPhase::AnswerSent);
    assert!(session.room_id.is_none());

    let exported = h.core.export_local_description().await.unwrap();
    assert!(!exported.is_empty());
}

#[tokio::test]
async fn exported_description_feeds_a_second_peer() {
    let mut a = harness();

    // No session yet: nothing to export.
    assert!(matches!(
        a.core.export_local_description().await,
        Err(Error::NegotiationFailed(_))
    ));

    a.core.create_room("AB12x").await.unwrap();
    let encoded = a.core.export_local_description().await.unwrap();

    let mut b = harness();
    b.core.manual_description(&encoded).await.unwrap();

    let session = b.core.session().unwrap();
    assert_eq!(session.role, Role::Callee);
    assert_eq!(session.phase, NegotiationPhase::AnswerSent);
    assert!(b
        .factory
        .last_peer()
        .calls()
        .contains(&PeerCall::CreateAnswer));
}

#[tokio::test]
async fn stable_answer_without_fresh_offer_is_ignored() {
    let mut h = harness();
    h.core.create_room("AB12x").await.unwrap();
    h.core.handle_answer(answer()).await.unwrap();

    let applied = |peer: &MockPeer| {
        peer.calls()
            .iter()
            .filter(|c| **c == PeerCall::SetRemoteDescription)
            .count()
    };
    let peer = h.factory.last_peer();
    assert_eq!(applied(&peer), 1);

    // A repeat answer with no offer in flight must not touch the peer.
    h.core.handle_answer(answer()).await.unwrap();
    assert_eq!(applied(&peer), 1);
    assert_eq!(h.core.session().unwrap().phase, NegotiationPhase::Stable);

    // Renegotiation puts an offer back in flight, so the next answer lands.
    h.core
        .handle(Event::Adapter(AdapterEvent::NegotiationNeeded))
        .await;
    h.core.handle_answer(answer()).await.unwrap();
    assert_eq!(applied(&peer), 2);
}

#[tokio::test]
async fn commands_drive_the_event_loop() {
    let mut h = harness();
    h.core
        .handle(Event::Command(Command::CreateRoom("AB12x".into())))
        .await;
    assert_eq!(h.core.session().unwrap().role, Role::Caller);

    h.core
        .handle(Event::Command(Command::SendChat("yo".into())))
        .await;
    assert_eq!(h.core.transcript(), &["yo".to_string()]);

    h.core.handle(Event::Command(Command::HangUp)).await;
    assert!(h.core.session().is_none());
    assert!(h.factory.last_peer().calls().contains(&PeerCall::Close));
}

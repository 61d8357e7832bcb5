use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::IceServer;
use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    IceConnectionState, IceGatheringState, PeerConnection, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, SenderId, SignalingState, TrackSender,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

struct State {
    signaling: SignalingState,
    ice: IceConnectionState,
    gathering: IceGatheringState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    offers_created: usize,
    answers_created: usize,
    rollbacks: usize,
    candidates_emitted: usize,
    applied_candidates: Vec<String>,
    senders: Vec<TrackSender>,
    next_sender: u64,
    add_track_calls: usize,
    replace_track_calls: usize,
    receive_only: Vec<TrackKind>,
    close_calls: usize,
    fail_next_offer: bool,
}

/// A peer connection that enforces the signaling state machine but moves no
/// media. With an event sink attached it also gathers one candidate per local
/// description and connects ICE once both descriptions are in place.
pub struct FakePeer {
    name: String,
    events: Option<PeerEventSink>,
    state: Mutex<State>,
}

impl FakePeer {
    pub fn new(name: &str) -> Self {
        Self::build(name, None)
    }

    pub fn with_events(name: &str, events: PeerEventSink) -> Self {
        Self::build(name, Some(events))
    }

    fn build(name: &str, events: Option<PeerEventSink>) -> Self {
        Self {
            name: name.to_string(),
            events,
            state: Mutex::new(State {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                gathering: IceGatheringState::New,
                local: None,
                remote: None,
                offers_created: 0,
                answers_created: 0,
                rollbacks: 0,
                candidates_emitted: 0,
                applied_candidates: Vec::new(),
                senders: Vec::new(),
                next_sender: 0,
                add_track_calls: 0,
                replace_track_calls: 0,
                receive_only: Vec::new(),
                close_calls: 0,
                fail_next_offer: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn add_track_calls(&self) -> usize {
        self.state.lock().add_track_calls
    }

    pub fn replace_track_calls(&self) -> usize {
        self.state.lock().replace_track_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn receive_only_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().receive_only.clone()
    }

    pub fn video_sender_track(&self) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|sender| sender.kind == TrackKind::Video)
            .and_then(|sender| sender.track_id.clone())
    }

    /// The next `create_offer` fails.
    pub fn fail_next_offer(&self) {
        self.state.lock().fail_next_offer = true;
    }

    /// Moves ICE to `ice` as the platform would, e.g. after a path failure.
    pub fn set_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.emit(vec![PeerEvent::IceConnectionState(ice)]);
    }

    fn emit(&self, events: Vec<PeerEvent>) {
        if let Some(sink) = &self.events {
            for event in events {
                sink.emit(event);
            }
        }
    }

    fn check_open(state: &State) -> Result<(), PeerError> {
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn invalid(op: &'static str, state: &State) -> PeerError {
        PeerError::InvalidState {
            op,
            state: state.signaling,
        }
    }

    /// Connects ICE the first time both sides have settled on descriptions.
    fn maybe_connect(&self, state: &mut State, events: &mut Vec<PeerEvent>) {
        if self.events.is_none()
            || state.signaling != SignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
            || state.ice != IceConnectionState::New
        {
            return;
        }
        state.ice = IceConnectionState::Connected;
        events.push(PeerEvent::IceConnectionState(IceConnectionState::Checking));
        events.push(PeerEvent::IceConnectionState(IceConnectionState::Connected));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if std::mem::take(&mut state.fail_next_offer) {
            return Err(PeerError::Rtc("scripted offer failure".into()));
        }
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(Self::invalid("create offer", &state));
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}",
            self.name, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid("create answer", &state));
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.name, state.answers_created
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            let next = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                _ => return Err(Self::invalid("set local description", &state)),
            };
            state.signaling = next;
            state.local = Some(description);
            state.candidates_emitted += 1;
            events.push(PeerEvent::SignalingState(next));
            if self.events.is_some() {
                state.gathering = IceGatheringState::Complete;
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{}:{}",
                    self.name, state.candidates_emitted
                ));
                candidate.sdp_mid = Some("0".into());
                events.push(PeerEvent::LocalCandidate(candidate));
            }
            self.maybe_connect(&mut state, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            let next = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                _ => return Err(Self::invalid("set remote description", &state)),
            };
            state.signaling = next;
            state.remote = Some(description);
            events.push(PeerEvent::SignalingState(next));
            self.maybe_connect(&mut state, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(Self::invalid("roll back", &state));
            }
            state.signaling = SignalingState::Stable;
            state.rollbacks += 1;
        }
        self.emit(vec![PeerEvent::SignalingState(SignalingState::Stable)]);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(Self::invalid("add ice candidate", &state));
        }
        state.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().gathering
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<TrackSender, PeerError> {
        let sender = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.add_track_calls += 1;
            state.next_sender += 1;
            let sender = TrackSender {
                id: SenderId(state.next_sender),
                kind: track.kind(),
                track_id: Some(track.id().to_string()),
            };
            state.senders.push(sender.clone());
            sender
        };
        self.emit(vec![PeerEvent::NegotiationNeeded]);
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Arc<MediaTrack>,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.replace_track_calls += 1;
        let slot = state
            .senders
            .iter_mut()
            .find(|existing| &existing.id == sender)
            .ok_or(PeerError::Unsupported("unknown sender"))?;
        slot.track_id = Some(track.id().to_string());
        Ok(())
    }

    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.receive_only.push(kind);
        Ok(())
    }

    fn senders(&self) -> Vec<TrackSender> {
        self.state.lock().senders.clone()
    }

    fn remote_track_count(&self) -> usize {
        0
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        Ok(())
    }
}

/// Hands out event-wired [`FakePeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakePeerFactory {
    name: String,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let name = format!("{}#{}", self.name, events.generation());
        let peer = Arc::new(FakePeer::with_events(&name, events));
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

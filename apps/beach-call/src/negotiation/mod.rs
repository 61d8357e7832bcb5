//! Offer/answer exchange with role-based glare resolution.
//!
//! Each side is either polite (the responder) or impolite (the initiator).
//! When both offer at once the polite side rolls back its own offer and
//! answers; the impolite side ignores the incoming offer and waits for the
//! answer to its own. No clocks or tie-breaking numbers are involved.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::peer::{IceConnectionState, PeerConnection, PeerError, SignalingState};
use crate::protocol::{IceCandidate, NegotiationRole, SdpKind, SessionDescription};
use crate::transport::TransportError;

pub mod ice_queue;

pub use ice_queue::PendingIceQueue;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("failed to send signal: {0}")]
    Signal(#[from] TransportError),
    #[error("no peer connection")]
    NoPeer,
    #[error("negotiation role not assigned yet")]
    NoRole,
    #[error("expected {expected:?} description, got {got:?}")]
    WrongKind { expected: SdpKind, got: SdpKind },
}

/// Messages the coordinator asks to have delivered to the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    RtcConnected,
}

pub trait SignalSink: Send + Sync {
    fn send_signal(&self, signal: Signal) -> Result<(), TransportError>;
}

/// The negotiation-relevant view of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationState {
    pub signaling: SignalingState,
    pub ice: IceConnectionState,
    pub making_offer: bool,
    pub ignore_offer: bool,
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            making_offer: false,
            ignore_offer: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered,
    /// Polite side yielded: its pending offer was rolled back first.
    AnsweredAfterRollback,
    /// Impolite side in glare; the offer was not applied.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCandidateOutcome {
    Sent,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOutcome {
    /// `notified` is true only the first time per session.
    Connected { notified: bool },
    Failed,
    Unchanged,
}

/// Conditions that must all hold before the initiator offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub transport_ready: bool,
    pub join_acked: bool,
    pub peer_present: bool,
    pub media_ready: bool,
}

pub struct Coordinator {
    sink: Arc<dyn SignalSink>,
    peer: Option<Arc<dyn PeerConnection>>,
    role: Option<NegotiationRole>,
    state: NegotiationState,
    readiness: Readiness,
    inbound: PendingIceQueue,
    outbound: PendingIceQueue,
    rtc_connected_sent: bool,
}

impl Coordinator {
    pub fn new(sink: Arc<dyn SignalSink>) -> Self {
        Self {
            sink,
            peer: None,
            role: None,
            state: NegotiationState::default(),
            readiness: Readiness::default(),
            inbound: PendingIceQueue::new(),
            outbound: PendingIceQueue::new(),
            rtc_connected_sent: false,
        }
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn rtc_connected_sent(&self) -> bool {
        self.rtc_connected_sent
    }

    pub fn peer(&self) -> Option<&Arc<dyn PeerConnection>> {
        self.peer.as_ref()
    }

    /// Installs a connection, replacing any previous one. Per-connection
    /// state starts over; the role and the connected notice carry across.
    /// Candidates that arrived before the first connection existed are kept.
    pub fn attach_peer(&mut self, peer: Arc<dyn PeerConnection>) -> Option<Arc<dyn PeerConnection>> {
        let dropped = if self.peer.is_some() {
            self.inbound.clear()
        } else {
            0
        };
        if dropped > 0 {
            tracing::debug!(
                target = "negotiation",
                dropped,
                "discarding candidates queued for previous connection"
            );
        }
        self.state = NegotiationState {
            signaling: peer.signaling_state(),
            ice: peer.ice_connection_state(),
            ..NegotiationState::default()
        };
        self.peer.replace(peer)
    }

    /// Hands the connection back to its owner and forgets queued candidates.
    pub fn detach_peer(&mut self) -> Option<Arc<dyn PeerConnection>> {
        self.inbound.clear();
        self.outbound.clear();
        self.state.making_offer = false;
        self.state.ignore_offer = false;
        self.peer.take()
    }

    /// Fixes the role. A later, different assignment is ignored.
    pub fn assign_role(&mut self, role: NegotiationRole) -> NegotiationRole {
        match self.role {
            Some(current) if current != role => {
                tracing::warn!(
                    target = "negotiation",
                    current = current.as_str(),
                    offered = role.as_str(),
                    "ignoring role change within session"
                );
                current
            }
            Some(current) => current,
            None => {
                tracing::debug!(
                    target = "negotiation",
                    role = role.as_str(),
                    polite = role.is_polite(),
                    "negotiation role assigned"
                );
                self.role = Some(role);
                role
            }
        }
    }

    pub fn set_transport_ready(&mut self, ready: bool) -> Result<(), NegotiationError> {
        self.readiness.transport_ready = ready;
        self.flush_local_candidates()
    }

    pub fn set_join_acked(&mut self, acked: bool) -> Result<(), NegotiationError> {
        self.readiness.join_acked = acked;
        self.flush_local_candidates()
    }

    pub fn set_peer_present(&mut self, present: bool) {
        self.readiness.peer_present = present;
    }

    pub fn set_media_ready(&mut self, ready: bool) {
        self.readiness.media_ready = ready;
    }

    pub fn on_signaling_state(&mut self, state: SignalingState) {
        self.state.signaling = state;
    }

    pub fn should_renegotiate(&self) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };
        let r = self.readiness;
        self.role == Some(NegotiationRole::Initiator)
            && r.transport_ready
            && r.join_acked
            && r.peer_present
            && r.media_ready
            && peer.signaling_state() == SignalingState::Stable
            && !self.state.making_offer
    }

    /// Offers if every precondition holds. Returns whether an offer went out.
    pub async fn maybe_renegotiate(&mut self) -> Result<bool, NegotiationError> {
        if !self.should_renegotiate() {
            return Ok(false);
        }
        self.make_offer().await?;
        Ok(true)
    }

    /// Creates, applies and sends a local offer. `making_offer` is cleared
    /// whatever the result.
    pub async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let peer = self.peer.clone().ok_or(NegotiationError::NoPeer)?;
        self.state.making_offer = true;
        let result = self.offer_with(&peer).await;
        self.state.making_offer = false;
        self.state.signaling = peer.signaling_state();
        if let Err(err) = &result {
            tracing::warn!(target = "negotiation", error = %err, "offer attempt failed");
        }
        result
    }

    async fn offer_with(&self, peer: &Arc<dyn PeerConnection>) -> Result<(), NegotiationError> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        tracing::debug!(
            target = "negotiation",
            role = self.role.map(NegotiationRole::as_str).unwrap_or("-"),
            "sending offer"
        );
        self.sink.send_signal(Signal::Offer(offer))?;
        Ok(())
    }

    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<OfferOutcome, NegotiationError> {
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::WrongKind {
                expected: SdpKind::Offer,
                got: offer.kind,
            });
        }
        let role = self.role.ok_or(NegotiationError::NoRole)?;
        let peer = self.peer.clone().ok_or(NegotiationError::NoPeer)?;

        let signaling = peer.signaling_state();
        self.state.signaling = signaling;
        let collision = self.state.making_offer || signaling != SignalingState::Stable;
        self.state.ignore_offer = !role.is_polite() && collision;
        if self.state.ignore_offer {
            tracing::debug!(
                target = "negotiation",
                state = ?signaling,
                making_offer = self.state.making_offer,
                "glare: holding our offer, ignoring remote"
            );
            return Ok(OfferOutcome::Ignored);
        }

        let mut rolled_back = false;
        if collision && signaling == SignalingState::HaveLocalOffer {
            tracing::debug!(target = "negotiation", "glare: rolling back local offer");
            peer.rollback_local_description().await?;
            rolled_back = true;
        }

        peer.set_remote_description(offer).await?;
        self.state.ignore_offer = false;
        self.flush_remote_candidates(&peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.state.signaling = peer.signaling_state();
        self.sink.send_signal(Signal::Answer(answer))?;

        Ok(if rolled_back {
            OfferOutcome::AnsweredAfterRollback
        } else {
            OfferOutcome::Answered
        })
    }

    /// Applies an answer. Returns false if no local offer was pending.
    pub async fn handle_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::WrongKind {
                expected: SdpKind::Answer,
                got: answer.kind,
            });
        }
        let peer = self.peer.clone().ok_or(NegotiationError::NoPeer)?;
        let signaling = peer.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            tracing::warn!(
                target = "negotiation",
                state = ?signaling,
                "dropping answer with no pending offer"
            );
            return Ok(false);
        }
        peer.set_remote_description(answer).await?;
        self.state.ignore_offer = false;
        self.state.signaling = peer.signaling_state();
        self.flush_remote_candidates(&peer).await;
        Ok(true)
    }

    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        if self.state.ignore_offer {
            return Ok(CandidateOutcome::Dropped);
        }
        let Some(peer) = self.peer.clone() else {
            self.inbound.push(candidate);
            return Ok(CandidateOutcome::Queued);
        };
        if !peer.has_remote_description().await {
            self.inbound.push(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        peer.add_ice_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn flush_remote_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        let pending = self.inbound.drain();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            target = "negotiation",
            count = pending.len(),
            "applying queued remote candidates"
        );
        for candidate in pending {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(target = "negotiation", error = %err, "queued candidate rejected");
            }
        }
    }

    /// Local candidates only leave once the relay socket is up and the join
    /// has been acknowledged.
    pub fn handle_local_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<LocalCandidateOutcome, NegotiationError> {
        if !self.can_send_candidates() {
            self.outbound.push(candidate);
            return Ok(LocalCandidateOutcome::Buffered);
        }
        self.sink.send_signal(Signal::Candidate(candidate))?;
        Ok(LocalCandidateOutcome::Sent)
    }

    fn can_send_candidates(&self) -> bool {
        self.readiness.transport_ready && self.readiness.join_acked
    }

    pub fn flush_local_candidates(&mut self) -> Result<(), NegotiationError> {
        if !self.can_send_candidates() || self.outbound.is_empty() {
            return Ok(());
        }
        for candidate in self.outbound.drain() {
            self.sink.send_signal(Signal::Candidate(candidate))?;
        }
        Ok(())
    }

    pub fn on_ice_state(&mut self, state: IceConnectionState) -> Result<IceOutcome, NegotiationError> {
        let previous = self.state.ice;
        self.state.ice = state;
        if state.is_connected() {
            if self.rtc_connected_sent {
                return Ok(IceOutcome::Connected { notified: false });
            }
            self.sink.send_signal(Signal::RtcConnected)?;
            self.rtc_connected_sent = true;
            return Ok(IceOutcome::Connected { notified: true });
        }
        if state == IceConnectionState::Failed && previous != IceConnectionState::Failed {
            return Ok(IceOutcome::Failed);
        }
        Ok(IceOutcome::Unchanged)
    }
}

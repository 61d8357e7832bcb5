//! The seam between negotiation logic and the platform peer connection.
//!
//! The coordinator only talks to [`PeerConnection`]; `rtc` adapts webrtc-rs to
//! it. Platform callbacks are funneled through a [`PeerEventSink`] tagged with
//! the generation of the connection that produced them, so events from a
//! discarded connection can be told apart.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::IceServer;
use crate::media::{MediaTrack, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription};

pub mod rtc;

pub use rtc::{WebRtcPeer, WebRtcPeerFactory};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    Rtc(String),
    #[error("cannot {op} in signaling state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },
    #[error("peer connection closed")]
    Closed,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSender {
    pub id: SenderId,
    pub kind: TrackKind,
    pub track_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    IceGatheringState(IceGatheringState),
    SignalingState(SignalingState),
    NegotiationNeeded,
    RemoteTrack { kind: TrackKind, track_id: String },
}

/// Forwards platform callbacks to the session loop, tagged with a generation.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    /// Reverts a pending local offer, returning to `stable`.
    async fn rollback_local_description(&self) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn ice_gathering_state(&self) -> IceGatheringState;

    /// Adds a sender for a new track kind. Requires renegotiation.
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<TrackSender, PeerError>;
    /// Swaps the track on an existing sender. No renegotiation needed.
    async fn replace_track(&self, sender: &SenderId, track: Arc<MediaTrack>)
    -> Result<(), PeerError>;
    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), PeerError>;
    fn senders(&self) -> Vec<TrackSender>;
    fn remote_track_count(&self) -> usize;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::{
    IceConnectionState, IceGatheringState, PeerConnection, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, SenderId, SignalingState, TrackSender,
};
use crate::api::IceServer;
use crate::media::{MediaTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn rtc_err(err: webrtc::Error) -> PeerError {
    PeerError::Rtc(err.to_string())
}

/// Builds webrtc-rs peer connections with the default codecs and interceptors.
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rtc_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(rtc_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_err)?);
        let peer = Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(Vec::new()),
            next_sender: AtomicU64::new(1),
            remote_tracks: Arc::new(AtomicUsize::new(0)),
        });
        peer.install_callbacks(events);
        Ok(peer)
    }
}

struct SenderEntry {
    info: TrackSender,
    sender: Arc<RTCRtpSender>,
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<SenderEntry>>,
    next_sender: AtomicU64,
    remote_tracks: Arc<AtomicUsize>,
}

impl WebRtcPeer {
    fn install_callbacks(&self, events: PeerEventSink) {
        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(target = "peer", error = %err, "failed to serialize local candidate");
                        }
                    }
                })
            }));

        let sink = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    tracing::debug!(target = "peer", state = %state, "ice connection state changed");
                    sink.emit(PeerEvent::IceConnectionState(map_ice_state(state)));
                })
            }));

        let sink = events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                        RTCIceGathererState::Complete => IceGatheringState::Complete,
                        _ => IceGatheringState::New,
                    };
                    sink.emit(PeerEvent::IceGatheringState(mapped));
                })
            }));

        let sink = events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(PeerEvent::SignalingState(map_signaling_state(state)));
                })
            }));

        let sink = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::NegotiationNeeded);
            })
        }));

        let sink = events;
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let remote_tracks = Arc::clone(&remote_tracks);
            Box::pin(async move {
                remote_tracks.fetch_add(1, Ordering::SeqCst);
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                sink.emit(PeerEvent::RemoteTrack {
                    kind,
                    track_id: track.id(),
                });
            })
        }));
    }

    fn next_sender_id(&self) -> SenderId {
        SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_err)
    }

    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        let state = self.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(PeerError::InvalidState {
                op: "rollback",
                state,
            });
        }
        let pending_sdp = self
            .pc
            .pending_local_description()
            .await
            .map(|desc| desc.sdp)
            .unwrap_or_default();
        let rollback: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": "rollback",
            "sdp": pending_sdp,
        }))
        .map_err(|err| PeerError::Rtc(err.to_string()))?;
        self.pc.set_local_description(rollback).await.map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_err)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state())
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<TrackSender, PeerError> {
        let local = track
            .rtp()
            .ok_or(PeerError::Unsupported("track has no rtp source"))?;
        let sender = self.pc.add_track(local).await.map_err(rtc_err)?;
        let info = TrackSender {
            id: self.next_sender_id(),
            kind: track.kind(),
            track_id: Some(track.id().to_string()),
        };
        self.senders.lock().push(SenderEntry {
            info: info.clone(),
            sender,
        });
        Ok(info)
    }

    async fn replace_track(
        &self,
        sender_id: &SenderId,
        track: Arc<MediaTrack>,
    ) -> Result<(), PeerError> {
        let local = track
            .rtp()
            .ok_or(PeerError::Unsupported("track has no rtp source"))?;
        let sender = self
            .senders
            .lock()
            .iter()
            .find(|entry| &entry.info.id == sender_id)
            .map(|entry| Arc::clone(&entry.sender))
            .ok_or(PeerError::Unsupported("unknown sender"))?;
        sender.replace_track(Some(local)).await.map_err(rtc_err)?;
        if let Some(entry) = self
            .senders
            .lock()
            .iter_mut()
            .find(|entry| &entry.info.id == sender_id)
        {
            entry.info.track_id = Some(track.id().to_string());
        }
        Ok(())
    }

    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), PeerError> {
        let codec = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(rtc_err)?;
        Ok(())
    }

    fn senders(&self) -> Vec<TrackSender> {
        self.senders
            .lock()
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    fn remote_track_count(&self) -> usize {
        self.remote_tracks.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(rtc_err)
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(rtc_err)
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::media::{TrackKind, TrackSource};
use crate::peer::{IceConnectionState, PeerConnection, SignalingState};
use crate::protocol::{EnvelopeKind, NegotiationRole};
use crate::session::{
    CallSession, SessionConfig, SessionDeps, SessionError, SessionHandle, SessionStatus,
    Termination,
};
use crate::transport::{Identity, TransportConfig, TransportRegistry};

use super::support::{FakeDevices, FakePeerFactory, TestRelay, init_tracing};

const GRACE: Duration = Duration::from_millis(300);

struct Party {
    handle: SessionHandle,
    peers: Arc<FakePeerFactory>,
    devices: FakeDevices,
}

fn identity(participant: &str) -> Identity {
    Identity::new(participant, format!("token-{participant}"))
}

fn transport_config(relay_url: &str) -> TransportConfig {
    let mut transport = TransportConfig::new(relay_url);
    transport.reconnect_delay = Duration::from_millis(50);
    transport
}

fn join(relay_url: &str, participant: &str, devices: FakeDevices) -> Party {
    join_with(relay_url, participant, devices, TransportRegistry::default())
}

fn join_with(
    relay_url: &str,
    participant: &str,
    devices: FakeDevices,
    registry: TransportRegistry,
) -> Party {
    let mut config = SessionConfig::new(identity(participant), transport_config(relay_url));
    config.grace_window = GRACE;
    config.waiting_tick = Duration::from_millis(100);

    let peers = Arc::new(FakePeerFactory::new(participant));
    let deps = SessionDeps {
        registry,
        peers: peers.clone(),
        devices: Arc::new(devices.clone()),
    };
    Party {
        handle: CallSession::start(config, deps).unwrap(),
        peers,
        devices,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Alice joins first and so initiates; bob responds.
async fn connected_pair(relay: &TestRelay, alice_devices: FakeDevices) -> (Party, Party) {
    let alice = join(&relay.url(), "alice", alice_devices);
    wait_until(|| relay.joins().len() == 1).await;
    let bob = join(&relay.url(), "bob", FakeDevices::default());
    alice
        .handle
        .wait_for_status(SessionStatus::Connected)
        .await
        .unwrap();
    bob.handle
        .wait_for_status(SessionStatus::Connected)
        .await
        .unwrap();
    (alice, bob)
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_parties_connect_and_announce_once() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, bob) = connected_pair(&relay, FakeDevices::default()).await;

    relay.wait_for(EnvelopeKind::RtcConnected, "alice", 1).await;
    relay.wait_for(EnvelopeKind::RtcConnected, "bob", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.received(EnvelopeKind::RtcConnected, "alice").len(), 1);
    assert_eq!(relay.received(EnvelopeKind::RtcConnected, "bob").len(), 1);
    assert!(relay.received(EnvelopeKind::Offer, "bob").is_empty());

    let joins = relay.joins();
    assert!(joins.iter().all(|(_, join)| !join.rejoin));

    let a = alice.handle.snapshot().await.unwrap();
    assert_eq!(a.role, Some(NegotiationRole::Initiator));
    assert_eq!(a.session_id.as_deref(), Some("s-1"));
    assert_eq!(a.signaling_state, Some(SignalingState::Stable));
    assert_eq!(a.local_tracks, 2);
    assert!(!a.receive_only);
    assert!(!a.making_offer);

    let b = bob.handle.snapshot().await.unwrap();
    assert_eq!(b.role, Some(NegotiationRole::Responder));
    assert_eq!(b.status, SessionStatus::Connected);
    assert_eq!(bob.peers.created().len(), 1);
    assert_eq!(alice.peers.created().len(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn ending_twice_releases_everything_once() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, bob) = connected_pair(&relay, FakeDevices::default()).await;

    alice.handle.end().await;
    alice.handle.end().await;
    assert_eq!(alice.handle.termination(), Some(Termination::LocalEnd));
    assert_eq!(alice.handle.status(), SessionStatus::Closed);

    for track in alice.devices.captured() {
        assert_eq!(track.stop_calls(), 1, "track {}", track.id());
    }
    for peer in alice.peers.created() {
        assert_eq!(peer.close_calls(), 1);
    }
    assert!(matches!(
        alice.handle.snapshot().await,
        Err(SessionError::Ended)
    ));

    assert_eq!(bob.handle.wait_for_termination().await, Termination::RemoteEnd);
    assert_eq!(bob.handle.status(), SessionStatus::Closed);
    assert_eq!(relay.received(EnvelopeKind::End, "alice").len(), 1);
    assert!(relay.received(EnvelopeKind::End, "bob").is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn peer_returning_inside_grace_window_resumes_the_call() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, _bob) = connected_pair(&relay, FakeDevices::default()).await;

    relay.send_to("alice", &TestRelay::envelope(EnvelopeKind::PeerLeft, "bob"));
    alice
        .handle
        .wait_for_status(SessionStatus::Reconnecting)
        .await
        .unwrap();

    tokio::time::sleep(GRACE / 3).await;
    relay.send_to("alice", &TestRelay::envelope(EnvelopeKind::PeerJoined, "bob"));
    alice
        .handle
        .wait_for_status(SessionStatus::Connected)
        .await
        .unwrap();

    tokio::time::sleep(GRACE * 2).await;
    assert_eq!(alice.handle.termination(), None);
    assert_eq!(alice.handle.status(), SessionStatus::Connected);

    // The connection was rebuilt with the same local media.
    let peers = alice.peers.created();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0].close_calls(), 1);
    assert_eq!(peers[1].close_calls(), 0);
    assert_eq!(peers[1].add_track_calls(), 2);
    assert_eq!(alice.devices.captured().len(), 2);
    assert_eq!(relay.received(EnvelopeKind::RtcConnected, "alice").len(), 1);
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Some(NegotiationRole::Initiator));
}

#[test_timeout::tokio_timeout_test(30)]
async fn grace_window_expiry_ends_the_session_once() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, _bob) = connected_pair(&relay, FakeDevices::default()).await;

    relay.send_to("alice", &TestRelay::envelope(EnvelopeKind::PeerLeft, "bob"));
    // A repeated notice does not open a second window.
    relay.send_to("alice", &TestRelay::envelope(EnvelopeKind::PeerLeft, "bob"));

    assert_eq!(
        alice.handle.wait_for_termination().await,
        Termination::GraceExpired
    );
    assert_eq!(alice.handle.status(), SessionStatus::Failed);

    alice.handle.end().await;
    tokio::time::sleep(GRACE).await;
    assert_eq!(alice.handle.termination(), Some(Termination::GraceExpired));
    for track in alice.devices.captured() {
        assert_eq!(track.stop_calls(), 1);
    }
    let peers = alice.peers.created();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].close_calls(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn relay_rejection_fails_without_reconnecting() {
    init_tracing();
    let relay = TestRelay::start().await;
    relay.reject_joins("session full");
    let alice = join(&relay.url(), "alice", FakeDevices::default());

    assert_eq!(
        alice.handle.wait_for_termination().await,
        Termination::RelayError("session full".into())
    );
    assert_eq!(alice.handle.status(), SessionStatus::Failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.joins().len(), 1);
    assert!(alice.peers.created().is_empty());
    assert!(alice.devices.captured().is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_relay_exhausts_the_session() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let alice = join(&format!("http://{addr}"), "alice", FakeDevices::default());
    assert_eq!(
        alice.handle.wait_for_termination().await,
        Termination::TransportExhausted
    );
    assert_eq!(alice.handle.status(), SessionStatus::Failed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn denied_capture_still_connects_receive_only() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, _bob) = connected_pair(&relay, FakeDevices::denied()).await;

    let snapshot = alice.handle.snapshot().await.unwrap();
    assert!(snapshot.receive_only);
    assert_eq!(snapshot.local_tracks, 0);
    assert!(
        snapshot
            .last_media_error
            .as_deref()
            .is_some_and(|error| error.contains("denied"))
    );
    let peer = alice.peers.latest().unwrap();
    assert_eq!(
        peer.receive_only_kinds(),
        vec![TrackKind::Audio, TrackKind::Video]
    );
    assert!(peer.senders().is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn toggles_and_screen_share_run_through_the_handle() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, _bob) = connected_pair(&relay, FakeDevices::default()).await;

    assert!(!alice.handle.toggle_mic().await.unwrap());
    assert!(!alice.handle.toggle_camera().await.unwrap());
    assert!(alice.handle.toggle_camera().await.unwrap());
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert!(!snapshot.audio_enabled);
    assert!(snapshot.video_enabled);

    alice.handle.share_screen().await.unwrap();
    let screen = alice
        .devices
        .captured()
        .into_iter()
        .find(|track| track.source() == TrackSource::Display)
        .unwrap();
    let peer = alice.peers.latest().unwrap();
    assert_eq!(peer.video_sender_track().as_deref(), Some(screen.id()));
    assert!(alice.handle.snapshot().await.unwrap().sharing_screen);

    // Ending the capture from outside restores the camera.
    screen.mark_ended();
    loop {
        if !alice.handle.snapshot().await.unwrap().sharing_screen {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let camera = alice
        .devices
        .captured()
        .into_iter()
        .find(|track| track.source() == TrackSource::Camera)
        .unwrap();
    assert_eq!(peer.video_sender_track().as_deref(), Some(camera.id()));
    assert_eq!(peer.add_track_calls(), 2);
    assert!(!alice.handle.stop_screen_share().await.unwrap());
}

#[test_timeout::tokio_timeout_test(30)]
async fn relay_drop_mid_call_rejoins_the_same_session() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, bob) = connected_pair(&relay, FakeDevices::default()).await;
    relay.wait_for(EnvelopeKind::RtcConnected, "alice", 1).await;
    let first_tracks = alice.devices.captured();
    assert_eq!(first_tracks.len(), 2);

    relay.drop_participant("alice");
    wait_until(|| relay.joins().len() == 3).await;
    wait_until(|| alice.peers.created().len() == 2 && bob.peers.created().len() == 2).await;
    alice
        .handle
        .wait_for_status(SessionStatus::Connected)
        .await
        .unwrap();
    bob.handle
        .wait_for_status(SessionStatus::Connected)
        .await
        .unwrap();

    // The stale connection and its capture were released exactly once.
    for track in &first_tracks {
        assert_eq!(track.stop_calls(), 1, "track {}", track.id());
    }
    let peers = alice.peers.created();
    assert_eq!(peers[0].close_calls(), 1);
    assert_eq!(peers[1].close_calls(), 0);
    assert_eq!(alice.devices.captured().len(), 4);

    let joins = relay.joins();
    assert_eq!(joins[2].0, "alice");
    assert!(joins[2].1.rejoin);
    let frames = relay.join_frames();
    assert_eq!(frames[2].session_id.as_deref(), Some("s-1"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.received(EnvelopeKind::RtcConnected, "alice").len(), 1);
    assert_eq!(alice.handle.termination(), None);
    assert_eq!(bob.handle.termination(), None);
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Some(NegotiationRole::Initiator));
    assert_eq!(snapshot.session_id.as_deref(), Some("s-1"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn ice_failure_ends_the_session() {
    init_tracing();
    let relay = TestRelay::start().await;
    let (alice, _bob) = connected_pair(&relay, FakeDevices::default()).await;
    let offers_before = relay.received(EnvelopeKind::Offer, "alice").len();
    let peer = alice.peers.latest().unwrap();
    let created_before = peer.offers_created();

    peer.set_ice_state(IceConnectionState::Failed);

    assert_eq!(
        alice.handle.wait_for_termination().await,
        Termination::IceFailed
    );
    assert_eq!(alice.handle.status(), SessionStatus::Failed);
    assert_eq!(peer.close_calls(), 1);
    for track in alice.devices.captured() {
        assert_eq!(track.stop_calls(), 1, "track {}", track.id());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.peers.created().len(), 1);
    assert_eq!(peer.offers_created(), created_before);
    assert_eq!(
        relay.received(EnvelopeKind::Offer, "alice").len(),
        offers_before
    );
    assert!(relay.received(EnvelopeKind::End, "alice").is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn shared_socket_closed_elsewhere_fails_the_session() {
    init_tracing();
    let relay = TestRelay::start().await;
    let registry = TransportRegistry::default();
    let alice = join_with(&relay.url(), "alice", FakeDevices::default(), registry.clone());
    wait_until(|| relay.joins().len() == 1).await;

    // A second surface holding the same credential shares the socket.
    let other = registry
        .acquire(&transport_config(&relay.url()), &identity("alice"))
        .unwrap();
    assert_eq!(registry.holders("token-alice"), 2);
    other.transport().unwrap().close();

    assert_eq!(
        alice.handle.wait_for_termination().await,
        Termination::TransportClosed
    );
    assert_eq!(alice.handle.status(), SessionStatus::Failed);
}

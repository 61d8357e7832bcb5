use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use super::signals::{Route, TransportSink};
use super::{Command, DebugSnapshot, SessionConfig, SessionDeps, SessionError, SessionStatus, Termination};
use crate::media::MediaPipeline;
use crate::negotiation::{CandidateOutcome, Coordinator, IceOutcome, OfferOutcome};
use crate::peer::{IceGatheringState, PeerConnection, PeerEvent, PeerEventSink};
use crate::protocol::{
    Admission, EndPayload, Envelope, EnvelopeKind, ErrorPayload, IceCandidate, JoinAckPayload,
    JoinPayload, SessionDescription,
};
use crate::supervisor::{PeerLossOutcome, ReconnectionSupervisor, ScheduledTask, SupervisorEvent};
use crate::transport::{SignalingTransport, TransportEvent, TransportLease};

pub(super) struct SessionActor {
    config: SessionConfig,
    deps: SessionDeps,
    transport: SignalingTransport,
    lease: TransportLease,
    transport_events: broadcast::Receiver<TransportEvent>,
    sink: Arc<TransportSink>,
    route: Arc<RwLock<Route>>,
    coordinator: Coordinator,
    media: MediaPipeline,
    supervisor: ReconnectionSupervisor,
    supervisor_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    peer_generation: u64,
    gathering: IceGatheringState,
    screen_tx: mpsc::UnboundedSender<String>,
    screen_rx: mpsc::UnboundedReceiver<String>,
    screen_watch: Option<ScheduledTask>,
    /// PEER_LEFT was seen since the current connection was negotiated.
    peer_went_away: bool,
    status_tx: watch::Sender<SessionStatus>,
    termination_tx: watch::Sender<Option<Termination>>,
    finished: bool,
}

impl SessionActor {
    pub(super) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        status_tx: watch::Sender<SessionStatus>,
        termination_tx: watch::Sender<Option<Termination>>,
    ) -> Result<Self, SessionError> {
        let lease = deps.registry.acquire(&config.transport, &config.identity)?;
        let transport = lease
            .transport()
            .cloned()
            .ok_or(SessionError::Ended)?;
        let transport_events = transport.subscribe();

        let route = Arc::new(RwLock::new(Route {
            session_id: config.session_id.clone(),
            reservation_id: config.reservation_id.clone(),
            remote_participant: None,
        }));
        let sink = Arc::new(TransportSink::new(
            transport.clone(),
            config.identity.participant_id.clone(),
            Arc::clone(&route),
        ));
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (screen_tx, screen_rx) = mpsc::unbounded_channel();

        Ok(Self {
            coordinator: Coordinator::new(sink.clone()),
            media: MediaPipeline::new(Arc::clone(&deps.devices), config.device_class),
            supervisor: ReconnectionSupervisor::new(
                config.grace_window,
                config.waiting_tick,
                supervisor_tx,
            ),
            config,
            deps,
            transport,
            lease,
            transport_events,
            sink,
            route,
            supervisor_rx,
            peer_tx,
            peer_rx,
            peer_generation: 0,
            gathering: IceGatheringState::New,
            screen_tx,
            screen_rx,
            screen_watch: None,
            peer_went_away: false,
            status_tx,
            termination_tx,
            finished: false,
        })
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.set_status(SessionStatus::Connecting);
        self.transport.bind_session(self.config.session_id.clone());
        if self.transport.is_ready() {
            // Shared socket that is already open; no Opened event will come.
            self.on_transport_opened().await;
        }
        self.transport.start();

        while !self.finished {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.teardown(Termination::LocalEnd).await,
                },
                event = self.transport_events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target = "session", skipped, "session lagged behind transport events");
                    }
                    Err(RecvError::Closed) => self.teardown(Termination::TransportExhausted).await,
                },
                Some((generation, event)) = self.peer_rx.recv() => {
                    self.handle_peer_event(generation, event).await;
                }
                Some(event) = self.supervisor_rx.recv() => self.handle_supervisor_event(event).await,
                Some(track_id) = self.screen_rx.recv() => self.on_screen_share_ended(&track_id).await,
            }
        }

        // Late callers still get answers, then see the channel close.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command).await;
        }
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::info!(
                target = "session",
                session_id = self.session_id().as_deref().unwrap_or("-"),
                from = ?previous,
                to = ?status,
                "session status changed"
            );
        }
    }

    fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    fn session_id(&self) -> Option<String> {
        self.route.read().session_id.clone()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleMic(reply) => {
                let enabled = !self.media.audio_enabled();
                self.media.set_audio_enabled(enabled);
                let _ = reply.send(enabled);
            }
            Command::ToggleCamera(reply) => {
                let enabled = !self.media.video_enabled();
                self.media.set_video_enabled(enabled);
                let _ = reply.send(enabled);
            }
            Command::ShareScreen(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let peer = self.coordinator.peer().cloned();
                let stopped = match self.media.stop_screen_share(peer.as_deref(), None).await {
                    Ok(stopped) => stopped,
                    Err(err) => {
                        tracing::warn!(target = "session", error = %err, "failed to restore camera");
                        true
                    }
                };
                self.screen_watch = None;
                let _ = reply.send(stopped);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::End(reply) => {
                self.teardown(Termination::LocalEnd).await;
                let _ = reply.send(());
            }
        }
    }

    async fn start_screen_share(&mut self) -> Result<(), SessionError> {
        if self.finished {
            return Err(SessionError::Ended);
        }
        let peer = self.ensure_peer().await?;
        let (screen, _) = self.media.start_screen_share(peer.as_ref()).await?;
        let screen_tx = self.screen_tx.clone();
        let watched = Arc::clone(&screen);
        self.screen_watch = Some(ScheduledTask::watch("screen-share-end", async move {
            watched.ended().await;
            let _ = screen_tx.send(watched.id().to_string());
        }));
        Ok(())
    }

    async fn on_screen_share_ended(&mut self, track_id: &str) {
        let peer = self.coordinator.peer().cloned();
        match self.media.stop_screen_share(peer.as_deref(), Some(track_id)).await {
            Ok(true) => self.screen_watch = None,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "failed to restore camera after screen share");
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_transport_opened().await,
            TransportEvent::Message(envelope) => self.handle_envelope(envelope).await,
            TransportEvent::Disconnected { reason } => {
                tracing::warn!(target = "session", reason = %reason, "relay connection lost");
                self.discard_connection().await;
                self.set_status(SessionStatus::Reconnecting);
            }
            TransportEvent::Reconnecting { attempt, .. } => {
                tracing::info!(target = "session", attempt, "waiting to reconnect to relay");
                self.set_status(SessionStatus::Reconnecting);
            }
            TransportEvent::Failed { attempts } => {
                tracing::warn!(target = "session", attempts, "relay unreachable; giving up");
                self.teardown(Termination::TransportExhausted).await;
            }
            TransportEvent::Closed => {
                if !self.finished {
                    tracing::warn!(target = "session", "shared relay socket closed underneath the session");
                    self.teardown(Termination::TransportClosed).await;
                }
            }
        }
    }

    async fn on_transport_opened(&mut self) {
        if self.status() == SessionStatus::Reconnecting && !self.supervisor.is_waiting() {
            self.set_status(SessionStatus::Connecting);
        }
        if let Err(err) = self.coordinator.set_transport_ready(true) {
            tracing::warn!(target = "session", error = %err, "failed to flush local candidates");
        }
        let payload = JoinPayload {
            reservation_id: self.config.reservation_id.clone(),
            rejoin: self.session_id().is_some(),
        };
        let join = match self.sink.envelope(EnvelopeKind::Join).with_payload(&payload) {
            Ok(join) => join,
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "failed to encode join");
                return;
            }
        };
        if let Err(err) = self.transport.send(&join) {
            tracing::warn!(target = "session", error = %err, "failed to send join");
        }
    }

    /// Transport loss invalidates the connection: stop local media, close the
    /// peer connection and wait for a fresh JOIN_ACK before negotiating again.
    async fn discard_connection(&mut self) {
        self.screen_watch = None;
        let stopped = self.media.stop_all();
        self.close_peer().await;
        let _ = self.coordinator.set_transport_ready(false);
        let _ = self.coordinator.set_join_acked(false);
        self.coordinator.set_media_ready(false);
        tracing::debug!(target = "session", stopped, "discarded peer connection after relay loss");
    }

    async fn close_peer(&mut self) {
        let Some(peer) = self.coordinator.detach_peer() else {
            return;
        };
        self.peer_generation += 1;
        self.gathering = IceGatheringState::New;
        if let Err(err) = peer.close().await {
            tracing::debug!(target = "session", error = %err, "peer close reported an error");
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let session_id = self.session_id();
        match envelope.admit(&self.config.identity.participant_id, session_id.as_deref()) {
            Admission::Accept => {}
            admission => {
                tracing::trace!(
                    target = "session",
                    kind = ?envelope.kind,
                    admission = ?admission,
                    "envelope not admitted"
                );
                return;
            }
        }

        let kind = envelope.kind;
        let result = match kind {
            EnvelopeKind::JoinAck => self.on_join_ack(envelope).await,
            EnvelopeKind::Offer => self.on_offer(envelope).await,
            EnvelopeKind::Answer => self.on_answer(envelope).await,
            EnvelopeKind::IceCandidate => self.on_remote_candidate(envelope).await,
            EnvelopeKind::PeerJoined => self.on_peer_joined(envelope).await,
            EnvelopeKind::PeerLeft => {
                self.on_peer_left();
                Ok(())
            }
            EnvelopeKind::RtcConnected => {
                tracing::debug!(target = "session", from = %envelope.from, "remote reports media connected");
                Ok(())
            }
            EnvelopeKind::End => {
                let reason = envelope
                    .payload_as::<EndPayload>()
                    .ok()
                    .and_then(|payload| payload.reason);
                tracing::info!(
                    target = "session",
                    reason = reason.as_deref().unwrap_or("-"),
                    "remote ended the call"
                );
                self.teardown(Termination::RemoteEnd).await;
                Ok(())
            }
            EnvelopeKind::Error => {
                let message = envelope
                    .payload_as::<ErrorPayload>()
                    .map(|payload| payload.message)
                    .unwrap_or_else(|_| "relay error".to_string());
                tracing::warn!(target = "session", message = %message, "relay rejected the session");
                self.teardown(Termination::RelayError(message)).await;
                Ok(())
            }
            EnvelopeKind::Join | EnvelopeKind::Heartbeat => Ok(()),
        };

        if let Err(err) = result {
            tracing::warn!(target = "session", kind = ?kind, error = %err, "failed to handle envelope");
        }
    }

    async fn on_join_ack(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let ack: JoinAckPayload = envelope.payload_as()?;
        let current = self.session_id();
        match (&current, &envelope.session_id) {
            (Some(known), Some(acked)) if known != acked => {
                tracing::warn!(
                    target = "session",
                    known = %known,
                    acked = %acked,
                    "ignoring join ack for another session"
                );
                return Ok(());
            }
            (None, None) => {
                tracing::warn!(target = "session", "join ack carried no session id");
                return Ok(());
            }
            _ => {}
        }
        if current.is_none() {
            self.route.write().session_id = envelope.session_id.clone();
            self.transport.bind_session(envelope.session_id.clone());
        }
        if envelope.reservation_id.is_some() {
            self.route.write().reservation_id = envelope.reservation_id.clone();
        }

        let role = self.coordinator.assign_role(ack.role);
        tracing::info!(
            target = "session",
            session_id = self.session_id().as_deref().unwrap_or("-"),
            role = role.as_str(),
            peer_present = ack.peer_present,
            "joined session"
        );
        self.coordinator.set_join_acked(true)?;
        self.coordinator.set_peer_present(ack.peer_present);

        let media_was_ready = self.media.is_ready();
        if !media_was_ready {
            // Failure is recorded by the pipeline; the call continues receive-only.
            let _ = self.media.acquire().await;
        }
        let had_peer = self.coordinator.peer().is_some();
        let peer = self.ensure_peer().await?;
        if had_peer && !media_was_ready {
            self.media.attach(peer.as_ref()).await?;
        }
        self.coordinator.set_media_ready(true);
        self.coordinator.maybe_renegotiate().await?;
        Ok(())
    }

    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerConnection>, SessionError> {
        if let Some(peer) = self.coordinator.peer() {
            return Ok(Arc::clone(peer));
        }
        self.peer_generation += 1;
        let events = PeerEventSink::new(self.peer_generation, self.peer_tx.clone());
        let peer = self
            .deps
            .peers
            .create(&self.config.ice_servers, events)
            .await?;
        self.coordinator.attach_peer(Arc::clone(&peer));
        if self.media.is_ready() {
            self.media.attach(peer.as_ref()).await?;
        }
        tracing::debug!(
            target = "session",
            generation = self.peer_generation,
            "created peer connection"
        );
        Ok(peer)
    }

    fn note_remote(&mut self, envelope: &Envelope) {
        self.coordinator.set_peer_present(true);
        let mut route = self.route.write();
        if route.remote_participant.as_deref() != Some(envelope.from.as_str()) {
            route.remote_participant = Some(envelope.from.clone());
        }
    }

    async fn on_offer(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let offer: SessionDescription = envelope.payload_as()?;
        self.note_remote(&envelope);
        self.ensure_peer().await?;
        match self.coordinator.handle_offer(offer).await? {
            OfferOutcome::Ignored => {}
            outcome => {
                tracing::debug!(target = "session", outcome = ?outcome, "answered remote offer");
            }
        }
        Ok(())
    }

    async fn on_answer(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let answer: SessionDescription = envelope.payload_as()?;
        self.note_remote(&envelope);
        self.coordinator.handle_answer(answer).await?;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let candidate: IceCandidate = envelope.payload_as()?;
        if let CandidateOutcome::Dropped = self.coordinator.handle_remote_candidate(candidate).await? {
            tracing::trace!(target = "session", "dropped candidate for ignored offer");
        }
        Ok(())
    }

    async fn on_peer_joined(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        self.note_remote(&envelope);
        let cancelled = self.supervisor.peer_returned();
        let went_away = std::mem::take(&mut self.peer_went_away);
        if cancelled || self.status() == SessionStatus::Reconnecting {
            self.set_status(SessionStatus::Connecting);
        }

        let negotiated = match self.coordinator.peer() {
            Some(peer) => peer.has_remote_description().await,
            None => false,
        };
        if went_away && negotiated {
            // The returning peer starts from scratch; so must we.
            tracing::info!(target = "session", "peer returned; rebuilding peer connection");
            self.close_peer().await;
            self.ensure_peer().await?;
        }
        self.coordinator.maybe_renegotiate().await?;
        Ok(())
    }

    fn on_peer_left(&mut self) {
        self.coordinator.set_peer_present(false);
        self.peer_went_away = true;
        match self.supervisor.peer_left() {
            PeerLossOutcome::GraceWindowStarted => self.set_status(SessionStatus::Reconnecting),
            PeerLossOutcome::AlreadyWaiting => {}
            PeerLossOutcome::NotYetConnected => self.set_status(SessionStatus::Connecting),
        }
    }

    async fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if generation != self.peer_generation || self.finished {
            tracing::trace!(target = "session", generation, "ignoring event from discarded peer connection");
            return;
        }
        let result = match event {
            PeerEvent::LocalCandidate(candidate) => self
                .coordinator
                .handle_local_candidate(candidate)
                .map(|_| ()),
            PeerEvent::IceConnectionState(state) => {
                tracing::debug!(target = "session", state = ?state, "ice connection state");
                match self.coordinator.on_ice_state(state) {
                    Ok(IceOutcome::Connected { notified }) => {
                        self.on_ice_connected(notified);
                        Ok(())
                    }
                    Ok(IceOutcome::Failed) => {
                        self.teardown(Termination::IceFailed).await;
                        Ok(())
                    }
                    Ok(IceOutcome::Unchanged) => Ok(()),
                    Err(err) => {
                        // The notice could not go out, but media is flowing.
                        self.on_ice_connected(false);
                        Err(err)
                    }
                }
            }
            PeerEvent::IceGatheringState(state) => {
                self.gathering = state;
                Ok(())
            }
            PeerEvent::SignalingState(state) => {
                self.coordinator.on_signaling_state(state);
                Ok(())
            }
            PeerEvent::NegotiationNeeded => self.coordinator.maybe_renegotiate().await.map(|_| ()),
            PeerEvent::RemoteTrack { kind, track_id } => {
                tracing::debug!(target = "session", kind = kind.as_str(), track_id = %track_id, "remote track");
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(target = "session", error = %err, "peer event handling failed");
        }
    }

    fn on_ice_connected(&mut self, notified: bool) {
        if self.supervisor.mark_connected() {
            tracing::info!(target = "session", "peer reconnected within grace window");
        }
        if notified {
            tracing::info!(
                target = "session",
                session_id = self.session_id().as_deref().unwrap_or("-"),
                "media connected"
            );
        }
        self.set_status(SessionStatus::Connected);
    }

    async fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::GraceExpired { generation } => {
                if self.supervisor.accept_expiry(generation) {
                    self.teardown(Termination::GraceExpired).await;
                }
            }
        }
    }

    /// Stops everything this session owns. Runs at most once.
    async fn teardown(&mut self, reason: Termination) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!(
            target = "session",
            session_id = self.session_id().as_deref().unwrap_or("-"),
            reason = ?reason,
            "ending session"
        );

        self.supervisor.cancel_all();
        self.screen_watch = None;

        if reason == Termination::LocalEnd && self.transport.is_ready() {
            let end = self
                .sink
                .envelope(EnvelopeKind::End)
                .with_payload(&EndPayload {
                    reason: Some("ended".into()),
                });
            if let Ok(end) = end {
                let _ = self.transport.send(&end);
            }
        }

        let stopped = self.media.stop_all();
        self.close_peer().await;
        if let Termination::RelayError(_) = reason {
            // Protocol rejection: no reconnect for anyone on this socket.
            self.transport.close();
        }
        self.lease.release();

        tracing::debug!(target = "session", stopped, "session resources released");
        self.set_status(reason.status());
        self.termination_tx.send_replace(Some(reason));
    }

    fn snapshot(&self) -> DebugSnapshot {
        let peer = self.coordinator.peer();
        let state = self.coordinator.state();
        DebugSnapshot {
            status: self.status(),
            session_id: self.session_id(),
            role: self.coordinator.role(),
            signaling_state: peer.map(|peer| peer.signaling_state()),
            ice_connection_state: peer.map(|peer| peer.ice_connection_state()),
            ice_gathering_state: peer.map(|_| self.gathering),
            making_offer: state.making_offer,
            ignore_offer: state.ignore_offer,
            local_tracks: self.media.local_track_count(),
            remote_tracks: peer.map(|peer| peer.remote_track_count()).unwrap_or(0),
            pending_remote_candidates: self.coordinator.pending_inbound(),
            pending_local_candidates: self.coordinator.pending_outbound(),
            reconnect_attempts: self.transport.reconnect_attempts(),
            receive_only: self.media.is_receive_only(),
            sharing_screen: self.media.is_sharing_screen(),
            audio_enabled: self.media.audio_enabled(),
            video_enabled: self.media.video_enabled(),
            last_media_error: self.media.last_error().map(str::to_string),
        }
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        if !self.finished {
            // Task aborted: nothing can be awaited, but the socket lease and
            // local tracks must not outlive the session.
            self.media.stop_all();
            self.lease.release();
            if let (Some(peer), Ok(runtime)) = (
                self.coordinator.detach_peer(),
                tokio::runtime::Handle::try_current(),
            ) {
                runtime.spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }
}

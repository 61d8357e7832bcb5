//! The call session controller.
//!
//! A session runs as a single task that owns the peer connection, the local
//! media and every timer. Transport frames, peer callbacks, supervisor timers
//! and caller commands are all funneled into that one loop, so handlers never
//! race each other; they only interleave at await points.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::IceServer;
use crate::media::{DeviceClass, MediaDevices, MediaError};
use crate::negotiation::NegotiationError;
use crate::peer::{IceConnectionState, IceGatheringState, PeerError, PeerFactory, SignalingState};
use crate::protocol::{NegotiationRole, ProtocolError};
use crate::supervisor::{DEFAULT_GRACE_WINDOW, DEFAULT_WAITING_TICK};
use crate::transport::{Identity, TransportConfig, TransportError, TransportRegistry};

mod actor;
mod signals;

pub use signals::TransportSink;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has ended")]
    Ended,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    /// Peer or relay dropped; waiting for it to come back.
    Reconnecting,
    Failed,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Closed)
    }
}

/// Why a session ended. Everything except a local or remote END is a failure
/// the caller should navigate away from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum Termination {
    LocalEnd,
    RemoteEnd,
    GraceExpired,
    TransportExhausted,
    /// Another holder of the shared relay socket closed it.
    TransportClosed,
    RelayError(String),
    IceFailed,
}

impl Termination {
    pub fn status(&self) -> SessionStatus {
        match self {
            Termination::LocalEnd | Termination::RemoteEnd => SessionStatus::Closed,
            _ => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSnapshot {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub role: Option<NegotiationRole>,
    pub signaling_state: Option<SignalingState>,
    pub ice_connection_state: Option<IceConnectionState>,
    pub ice_gathering_state: Option<IceGatheringState>,
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub local_tracks: usize,
    pub remote_tracks: usize,
    pub pending_remote_candidates: usize,
    pub pending_local_candidates: usize,
    pub reconnect_attempts: u32,
    pub receive_only: bool,
    pub sharing_screen: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub last_media_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: Identity,
    pub transport: TransportConfig,
    pub reservation_id: Option<String>,
    /// Known when rejoining an existing session.
    pub session_id: Option<String>,
    pub device_class: DeviceClass,
    pub ice_servers: Vec<IceServer>,
    pub grace_window: Duration,
    pub waiting_tick: Duration,
}

impl SessionConfig {
    pub fn new(identity: Identity, transport: TransportConfig) -> Self {
        Self {
            identity,
            transport,
            reservation_id: None,
            session_id: None,
            device_class: DeviceClass::default(),
            ice_servers: IceServer::fallback(),
            grace_window: DEFAULT_GRACE_WINDOW,
            waiting_tick: DEFAULT_WAITING_TICK,
        }
    }
}

/// Platform collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: TransportRegistry,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

#[derive(Debug)]
pub(crate) enum Command {
    ToggleMic(oneshot::Sender<bool>),
    ToggleCamera(oneshot::Sender<bool>),
    ShareScreen(oneshot::Sender<Result<(), SessionError>>),
    StopScreenShare(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<DebugSnapshot>),
    End(oneshot::Sender<()>),
}

pub struct CallSession;

impl CallSession {
    /// Opens (or shares) the relay socket and starts the session task.
    pub fn start(config: SessionConfig, deps: SessionDeps) -> Result<SessionHandle, SessionError> {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (termination_tx, termination_rx) = watch::channel(None);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let actor = actor::SessionActor::new(config, deps, status_tx, termination_tx)?;
        tokio::spawn(actor.run(commands_rx));

        Ok(SessionHandle {
            commands: commands_tx,
            status: status_rx,
            termination: termination_rx,
        })
    }
}

/// Caller-facing controls for a running session. Cheap to clone; the session
/// ends when `end` is called or every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    termination: watch::Receiver<Option<Termination>>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn wait_for_status(&self, target: SessionStatus) -> Result<(), SessionError> {
        let mut rx = self.status.clone();
        rx.wait_for(|status| *status == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Ended)
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination.borrow().clone()
    }

    pub async fn wait_for_termination(&self) -> Termination {
        let mut rx = self.termination.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Termination::LocalEnd),
            Err(_) => self.termination().unwrap_or(Termination::LocalEnd),
        }
    }

    /// Flips the microphone. Returns whether it is now enabled.
    pub async fn toggle_mic(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleMic).await
    }

    /// Flips the camera. Returns whether it is now enabled.
    pub async fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleCamera).await
    }

    pub async fn share_screen(&self) -> Result<(), SessionError> {
        self.request(Command::ShareScreen).await?
    }

    pub async fn stop_screen_share(&self) -> Result<bool, SessionError> {
        self.request(Command::StopScreenShare).await
    }

    pub async fn snapshot(&self) -> Result<DebugSnapshot, SessionError> {
        self.request(Command::Snapshot).await
    }

    /// Ends the call. Calling it again, or after the session already ended,
    /// does nothing.
    pub async fn end(&self) {
        let _ = self.request(Command::End).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::Ended)?;
        rx.await.map_err(|_| SessionError::Ended)
    }
}

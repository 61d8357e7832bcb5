use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Envelope, ProtocolError};
use crate::supervisor::MAX_RECONNECT_ATTEMPTS;

pub mod registry;
pub mod signaling;
pub mod url;

pub use registry::{TransportLease, TransportRegistry};
pub use signaling::SignalingTransport;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport not ready")]
    NotReady,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Who is speaking on the relay socket and the bearer credential it presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: String,
    pub token: String,
}

impl Identity {
    pub fn new(participant_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub relay_url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl TransportConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Notifications fanned out to every holder of a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Message(Envelope),
    /// The socket dropped without being asked to.
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget exhausted; no further attempts will be made.
    Failed { attempts: u32 },
    /// Closed on request; no reconnect follows.
    Closed,
}

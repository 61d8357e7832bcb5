use std::sync::Arc;

use parking_lot::RwLock;

use crate::negotiation::{Signal, SignalSink};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::transport::{SignalingTransport, TransportError};

/// Addressing shared between the session loop and its outbound sink.
#[derive(Debug, Default)]
pub struct Route {
    pub session_id: Option<String>,
    pub reservation_id: Option<String>,
    pub remote_participant: Option<String>,
}

/// Wraps negotiation signals in envelopes and writes them to the relay.
pub struct TransportSink {
    transport: SignalingTransport,
    from: String,
    route: Arc<RwLock<Route>>,
}

impl TransportSink {
    pub fn new(transport: SignalingTransport, from: impl Into<String>, route: Arc<RwLock<Route>>) -> Self {
        Self {
            transport,
            from: from.into(),
            route,
        }
    }

    pub fn envelope(&self, kind: EnvelopeKind) -> Envelope {
        let route = self.route.read();
        Envelope::new(kind, self.from.clone())
            .with_session(route.session_id.clone())
            .with_reservation(route.reservation_id.clone())
            .addressed_to(route.remote_participant.clone())
    }
}

impl SignalSink for TransportSink {
    fn send_signal(&self, signal: Signal) -> Result<(), TransportError> {
        let envelope = match &signal {
            Signal::Offer(offer) => self.envelope(EnvelopeKind::Offer).with_payload(offer)?,
            Signal::Answer(answer) => self.envelope(EnvelopeKind::Answer).with_payload(answer)?,
            Signal::Candidate(candidate) => self
                .envelope(EnvelopeKind::IceCandidate)
                .with_payload(candidate)?,
            Signal::RtcConnected => self.envelope(EnvelopeKind::RtcConnected),
        };
        self.transport.send(&envelope)
    }
}

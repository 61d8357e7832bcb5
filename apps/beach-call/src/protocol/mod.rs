//! Wire protocol spoken with the signaling relay.
//!
//! Every frame is a single JSON [`Envelope`]. Media never passes through the
//! relay; only connection metadata (descriptions, candidates, presence) does.

pub mod envelope;
pub mod payload;

pub use envelope::{Admission, Envelope, EnvelopeKind, ProtocolError};
pub use payload::{
    EndPayload, ErrorPayload, IceCandidate, JoinAckPayload, JoinPayload, NegotiationRole,
    SdpKind, SessionDescription,
};

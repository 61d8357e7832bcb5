use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Join,
    JoinAck,
    Offer,
    Answer,
    IceCandidate,
    RtcConnected,
    Heartbeat,
    PeerJoined,
    PeerLeft,
    End,
    Error,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:?} envelope is missing its payload")]
    MissingPayload(EnvelopeKind),
}

/// One frame on the relay socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Outcome of checking an inbound envelope against the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Authored by the local participant and echoed back by the relay.
    Echo,
    ForeignSession,
    /// No session has been acknowledged yet.
    NoSession,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: None,
            reservation_id: None,
            from: from.into(),
            to: None,
            payload: None,
            ts: chrono::Utc::now().timestamp_millis(),
            trace_id: Some(Uuid::new_v4().to_string()),
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_reservation(mut self, reservation_id: Option<String>) -> Self {
        self.reservation_id = reservation_id;
        self
    }

    pub fn addressed_to(mut self, to: Option<String>) -> Self {
        self.to = to;
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self
            .payload
            .as_ref()
            .ok_or(ProtocolError::MissingPayload(self.kind))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == EnvelopeKind::Heartbeat
    }

    /// JOIN_ACK always passes since it is how the session id is learned.
    /// Before that only ERROR is let through so a rejected JOIN still surfaces.
    pub fn admit(&self, local_participant: &str, local_session: Option<&str>) -> Admission {
        if self.kind == EnvelopeKind::JoinAck {
            return Admission::Accept;
        }
        if self.from == local_participant {
            return Admission::Echo;
        }
        match local_session {
            None if self.kind == EnvelopeKind::Error => Admission::Accept,
            None => Admission::NoSession,
            Some(expected) if self.session_id.as_deref() == Some(expected) => Admission::Accept,
            Some(_) => Admission::ForeignSession,
        }
    }
}

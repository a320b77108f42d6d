use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::BusResult;

/// Identity of one participant for the lifetime of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a new session entry. Not meant to survive a restart.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One negotiation message as it travels through the relay.
///
/// The payload is opaque to the bus; the call layer decides how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    session_id: String,
    from_peer: PeerId,
    kind: SignalKind,
    payload: Value,
}

impl SignalEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        from_peer: PeerId,
        kind: SignalKind,
        payload: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from_peer,
            kind,
            payload,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn from_peer(&self) -> &PeerId {
        &self.from_peer
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_from(&self, peer: &PeerId) -> bool {
        &self.from_peer == peer
    }

    pub fn encode(&self) -> BusResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use signal_bus::{BusError, PeerId, SignalBus, SignalEnvelope, SignalKind};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session description blob in the shape browsers exchange
/// (`{"type": "offer", "sdp": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One reachability candidate, serialized like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signal payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{kind} envelope carried a {found:?} description")]
    KindMismatch {
        kind: SignalKind,
        found: DescriptionKind,
    },
    #[error("signal relay unavailable: {0}")]
    Bus(#[from] BusError),
}

/// Envelope contents decoded for the negotiation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl InboundSignal {
    pub fn from_envelope(envelope: &SignalEnvelope) -> Result<Self, SignalError> {
        let payload = envelope.payload().clone();
        match envelope.kind() {
            SignalKind::Offer => {
                let description = expect_description(SignalKind::Offer, DescriptionKind::Offer, payload)?;
                Ok(InboundSignal::Offer(description))
            }
            SignalKind::Answer => {
                let description =
                    expect_description(SignalKind::Answer, DescriptionKind::Answer, payload)?;
                Ok(InboundSignal::Answer(description))
            }
            SignalKind::Candidate => Ok(InboundSignal::Candidate(serde_json::from_value(payload)?)),
        }
    }
}

fn expect_description(
    kind: SignalKind,
    expected: DescriptionKind,
    payload: Value,
) -> Result<SessionDescription, SignalError> {
    let description: SessionDescription = serde_json::from_value(payload)?;
    if description.kind != expected {
        return Err(SignalError::KindMismatch {
            kind,
            found: description.kind,
        });
    }
    Ok(description)
}

/// Publishes this peer's negotiation messages into one session.
#[derive(Clone)]
pub struct SignalSender {
    bus: Arc<dyn SignalBus>,
    session_id: String,
    local_peer: PeerId,
}

impl SignalSender {
    pub fn new(bus: Arc<dyn SignalBus>, session_id: impl Into<String>, local_peer: PeerId) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
            local_peer,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SignalError> {
        self.send(SignalKind::Offer, serde_json::to_value(offer)?)
            .await
    }

    pub async fn send_answer(&self, answer: &SessionDescription) -> Result<(), SignalError> {
        self.send(SignalKind::Answer, serde_json::to_value(answer)?)
            .await
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SignalError> {
        self.send(SignalKind::Candidate, serde_json::to_value(candidate)?)
            .await
    }

    async fn send(&self, kind: SignalKind, payload: Value) -> Result<(), SignalError> {
        let envelope = SignalEnvelope::new(
            self.session_id.clone(),
            self.local_peer.clone(),
            kind,
            payload,
        );
        self.bus.publish(envelope).await?;
        debug!(
            target = "voice.signal",
            session_id = %self.session_id,
            %kind,
            "signal published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signal_bus::LocalBus;

    #[test]
    fn candidate_uses_browser_field_names() {
        let value = serde_json::to_value(IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host"))
            .unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value["usernameFragment"].is_null());
    }

    #[test]
    fn decodes_candidate_without_optional_fields() {
        let envelope = SignalEnvelope::new(
            "S",
            PeerId::new("p"),
            SignalKind::Candidate,
            json!({"candidate": "candidate:2"}),
        );
        let InboundSignal::Candidate(candidate) = InboundSignal::from_envelope(&envelope).unwrap()
        else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.candidate, "candidate:2");
        assert_eq!(candidate.sdp_mid, None);
    }

    #[test]
    fn rejects_answer_payload_inside_offer_envelope() {
        let envelope = SignalEnvelope::new(
            "S",
            PeerId::new("p"),
            SignalKind::Offer,
            json!({"type": "answer", "sdp": "v=0"}),
        );
        assert!(matches!(
            InboundSignal::from_envelope(&envelope),
            Err(SignalError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn sender_stamps_session_and_peer() {
        let bus = Arc::new(LocalBus::new());
        let sender = SignalSender::new(bus.clone(), "ROOM42", PeerId::new("alice"));
        sender
            .send_offer(&SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let history = bus.history("ROOM42");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_peer().as_str(), "alice");
        assert_eq!(history[0].kind(), SignalKind::Offer);
        assert_eq!(history[0].payload()["type"], "offer");
    }

    #[tokio::test]
    async fn sender_reports_closed_relay() {
        let bus = Arc::new(LocalBus::new());
        bus.close();
        let sender = SignalSender::new(bus, "ROOM42", PeerId::new("alice"));
        assert!(matches!(
            sender.send_candidate(&IceCandidate::new("candidate:1")).await,
            Err(SignalError::Bus(BusError::Closed))
        ));
    }
}

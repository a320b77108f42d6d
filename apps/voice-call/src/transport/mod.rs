use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::media::LocalAudioTrack;
use crate::signaling::{IceCandidate, SessionDescription};

pub mod mock;
pub mod webrtc;

/// Connectivity as reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteTrack),
}

/// Invoked from transport-owned tasks; must not block.
pub type PeerEventCallback = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("negotiation step failed: {0}")]
    Negotiation(String),
    #[error("peer connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn add_track(&self, track: &LocalAudioTrack) -> Result<(), PeerError>;

    /// Closing an already closed connection is a no-op.
    async fn close(&self);
}

/// Opens peer connections. Events for the new connection are delivered
/// through `events` until it is closed.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventCallback) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use super::candidate_queue::CandidateQueue;
use crate::media::{
    CaptureConstraints, CaptureError, CaptureHandle, LocalAudioTrack, MediaCaptureGateway,
};
use crate::signaling::{IceCandidate, SessionDescription, SignalError, SignalSender};
use crate::transport::{PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventCallback};

/// Receives transport events tagged with the generation of the connection
/// that produced them.
pub type GenerationEvents = Arc<dyn Fn(u64, PeerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    NoConnection,
    /// Connection allocated for an outgoing call; local offer in progress.
    AwaitingLocalOffer,
    AwaitingRemoteAnswer,
    /// Connection allocated for an inbound offer that is being applied.
    AwaitingRemoteOffer,
    Negotiated,
}

/// What happened to an inbound answer or candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Queued,
    Discarded,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("microphone unavailable: {0}")]
    MediaUnavailable(#[from] CaptureError),
    #[error("a connection is already active")]
    AlreadyInCall,
    #[error("transport failure: {0}")]
    Transport(#[from] PeerError),
    #[error("signaling failure: {0}")]
    Signaling(#[from] SignalError),
}

/// The one live peer connection together with the capture feeding it.
pub struct ConnectionHandle {
    generation: u64,
    peer: Arc<dyn PeerConnection>,
    capture: Option<CaptureHandle>,
    gateway: Arc<dyn MediaCaptureGateway>,
    has_remote_description: bool,
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn tracks(&self) -> &[LocalAudioTrack] {
        self.capture.as_ref().map(CaptureHandle::tracks).unwrap_or(&[])
    }

    pub fn is_muted(&self) -> bool {
        self.tracks().first().is_some_and(|track| !track.is_enabled())
    }

    fn set_muted(&self, muted: bool) {
        if let Some(capture) = &self.capture {
            capture.set_enabled(!muted);
        }
    }

    /// Closes the connection, then stops and releases the capture.
    pub async fn release(mut self) {
        self.peer.close().await;
        if let Some(capture) = self.capture.take() {
            self.gateway.release(&capture);
        }
        debug!(target = "voice.call", generation = self.generation, "connection released");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        warn!(
            target = "voice.call",
            generation = self.generation,
            "connection dropped without release; releasing capture"
        );
        self.gateway.release(&capture);
        if let Ok(runtime) = Handle::try_current() {
            let peer = Arc::clone(&self.peer);
            runtime.spawn(async move { peer.close().await });
        }
    }
}

/// Offer/answer state machine for a single peer.
///
/// Owns at most one [`ConnectionHandle`]. Every failure after media was
/// acquired tears the connection down before the error is returned, so a
/// failed step never leaves a capture or connection behind.
pub struct NegotiationEngine {
    connector: Arc<dyn PeerConnector>,
    capture: Arc<dyn MediaCaptureGateway>,
    signals: SignalSender,
    constraints: CaptureConstraints,
    events: GenerationEvents,
    state: NegotiationState,
    connection: Option<ConnectionHandle>,
    candidates: CandidateQueue,
    generation: u64,
}

impl NegotiationEngine {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        capture: Arc<dyn MediaCaptureGateway>,
        signals: SignalSender,
        constraints: CaptureConstraints,
        events: GenerationEvents,
    ) -> Self {
        Self {
            connector,
            capture,
            signals,
            constraints,
            events,
            state: NegotiationState::NoConnection,
            connection: None,
            candidates: CandidateQueue::new(),
            generation: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn signals(&self) -> &SignalSender {
        &self.signals
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Generation of the most recently opened connection (0 before any).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` names the live connection.
    pub fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub async fn start_outgoing(&mut self) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::NoConnection {
            return Err(NegotiationError::AlreadyInCall);
        }
        self.candidates.purge();
        let connection = self.open_connection().await?;
        let generation = connection.generation;
        self.connection = Some(connection);
        self.state = NegotiationState::AwaitingLocalOffer;

        if let Err(err) = self.send_offer().await {
            warn!(target = "voice.call", generation, error = %err, "outgoing negotiation failed");
            self.teardown().await;
            return Err(err);
        }
        info!(target = "voice.call", generation, "offer published");
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        let peer = self.current_peer()?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.state = NegotiationState::AwaitingRemoteAnswer;
        self.signals.send_offer(&offer).await?;
        Ok(())
    }

    pub async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::NoConnection {
            debug!(
                target = "voice.call",
                state = ?self.state,
                "ignoring inbound offer while a connection is active"
            );
            return Err(NegotiationError::AlreadyInCall);
        }
        let connection = self.open_connection().await?;
        let generation = connection.generation;
        self.connection = Some(connection);
        self.state = NegotiationState::AwaitingRemoteOffer;

        if let Err(err) = self.answer(offer).await {
            warn!(target = "voice.call", generation, error = %err, "answering inbound offer failed");
            self.teardown().await;
            return Err(err);
        }
        info!(target = "voice.call", generation, "answer published");
        Ok(())
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let peer = self.current_peer()?;
        peer.set_remote_description(offer).await?;
        self.mark_remote_description();
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.signals.send_answer(&answer).await?;
        self.state = NegotiationState::Negotiated;
        self.flush_candidates().await;
        Ok(())
    }

    /// Answers outside `AwaitingRemoteAnswer` are stale or duplicated and
    /// come back as [`Disposition::Discarded`].
    pub async fn on_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<Disposition, NegotiationError> {
        if self.state != NegotiationState::AwaitingRemoteAnswer {
            debug!(target = "voice.call", state = ?self.state, "discarding stale answer");
            return Ok(Disposition::Discarded);
        }
        let peer = self.current_peer()?;
        if let Err(err) = peer.set_remote_description(answer).await {
            warn!(target = "voice.call", error = %err, "remote answer rejected");
            self.teardown().await;
            return Err(err.into());
        }
        self.mark_remote_description();
        self.state = NegotiationState::Negotiated;
        self.flush_candidates().await;
        Ok(Disposition::Applied)
    }

    /// Publishes a locally gathered candidate. Failures are only logged.
    pub async fn on_local_candidate(&self, candidate: &IceCandidate) {
        if let Err(err) = self.signals.send_candidate(candidate).await {
            warn!(target = "voice.call", error = %err, "failed to publish local candidate");
        }
    }

    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Disposition {
        if self.state != NegotiationState::Negotiated {
            self.candidates.enqueue(candidate);
            trace!(target = "voice.call", queued = self.candidates.len(), "remote candidate queued");
            return Disposition::Queued;
        }
        let Ok(peer) = self.current_peer() else {
            return Disposition::Discarded;
        };
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => Disposition::Applied,
            Err(err) => {
                warn!(target = "voice.call", error = %err, "remote candidate rejected");
                Disposition::Discarded
            }
        }
    }

    /// Flips the enabled flag of the local tracks. Returns the new muted
    /// state, or `None` without a connection.
    pub fn toggle_mute(&mut self) -> Option<bool> {
        let connection = self.connection.as_ref()?;
        let muted = !connection.is_muted();
        connection.set_muted(muted);
        Some(muted)
    }

    /// Releases the connection and pending candidates. Safe to repeat.
    pub async fn teardown(&mut self) {
        self.candidates.purge();
        self.state = NegotiationState::NoConnection;
        if let Some(connection) = self.connection.take() {
            connection.release().await;
        }
    }

    /// Acquires media, opens a connection and attaches the tracks as one
    /// step; anything acquired is released again if a later part fails.
    async fn open_connection(&mut self) -> Result<ConnectionHandle, NegotiationError> {
        let capture = self.capture.acquire(&self.constraints).await?;

        self.generation += 1;
        let generation = self.generation;
        let events = Arc::clone(&self.events);
        let callback: PeerEventCallback = Arc::new(move |event: PeerEvent| events(generation, event));

        let peer = match self.connector.connect(callback).await {
            Ok(peer) => peer,
            Err(err) => {
                self.capture.release(&capture);
                return Err(err.into());
            }
        };
        let connection = ConnectionHandle {
            generation,
            peer,
            capture: Some(capture),
            gateway: Arc::clone(&self.capture),
            has_remote_description: false,
        };
        if let Err(err) = attach_tracks(&connection).await {
            connection.release().await;
            return Err(err.into());
        }
        debug!(target = "voice.call", generation, "connection opened");
        Ok(connection)
    }

    fn current_peer(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.connection
            .as_ref()
            .map(|connection| Arc::clone(&connection.peer))
            .ok_or(NegotiationError::Transport(PeerError::Closed))
    }

    fn mark_remote_description(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.has_remote_description = true;
        }
    }

    async fn flush_candidates(&mut self) {
        let ready = self
            .connection
            .as_ref()
            .is_some_and(ConnectionHandle::has_remote_description);
        let pending = self.candidates.drain_if_ready(ready);
        if pending.is_empty() {
            return;
        }
        let Ok(peer) = self.current_peer() else {
            return;
        };
        debug!(target = "voice.call", count = pending.len(), "applying queued candidates");
        for candidate in pending {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(target = "voice.call", error = %err, "queued candidate rejected");
            }
        }
    }
}

async fn attach_tracks(connection: &ConnectionHandle) -> Result<(), PeerError> {
    for track in connection.tracks() {
        connection.peer.add_track(track).await?;
    }
    Ok(())
}

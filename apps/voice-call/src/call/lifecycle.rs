use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use signal_bus::{BusError, PeerId, SignalBus, SignalEnvelope, SignalHandler, Subscription};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::negotiation::{Disposition, GenerationEvents, NegotiationEngine, NegotiationError};
use crate::media::{CaptureConstraints, CaptureError, MediaCaptureGateway};
use crate::playback::{PlaybackSink, RemotePlayback};
use crate::signaling::{InboundSignal, SessionDescription, SignalSender};
use crate::transport::{PeerConnector, PeerEvent, PeerState};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub muted: bool,
}

impl CallStatus {
    pub const IDLE: CallStatus = CallStatus {
        state: CallState::Idle,
        muted: false,
    };
}

/// One-off notifications for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    Calling,
    IncomingCall,
    MediaUnavailable { reason: String },
    ConnectionLost,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUpdate {
    Status(CallStatus),
    Notice(CallNotice),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,
    #[error("not in a call")]
    NotInCall,
    #[error("microphone unavailable: {0}")]
    MediaUnavailable(CaptureError),
    #[error(transparent)]
    Negotiation(NegotiationError),
    #[error("signal relay unavailable: {0}")]
    Relay(#[from] BusError),
    #[error("call controller has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIntent {
    StartCall,
    ToggleMute,
    Hangup,
    QueryStatus,
}

impl CallIntent {
    /// Intents that come from the user, as opposed to status polling.
    pub fn is_user_gesture(self) -> bool {
        !matches!(self, CallIntent::QueryStatus)
    }
}

pub type IntentReply = oneshot::Sender<Result<CallStatus, CallError>>;

/// Everything the call actor reacts to, in arrival order.
#[derive(Debug)]
pub enum CallEvent {
    Intent {
        intent: CallIntent,
        reply: Option<IntentReply>,
    },
    Signal(SignalEnvelope),
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Call state machine. Owns the negotiation engine and is driven one
/// [`CallEvent`] at a time.
pub struct CallSession {
    engine: NegotiationEngine,
    playback: RemotePlayback,
    state: CallState,
    muted: bool,
    status: watch::Sender<CallStatus>,
    updates: broadcast::Sender<CallUpdate>,
}

impl CallSession {
    pub fn new(engine: NegotiationEngine, playback: RemotePlayback) -> Self {
        let (status, _) = watch::channel(CallStatus::IDLE);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            engine,
            playback,
            state: CallState::Idle,
            muted: false,
            status,
            updates,
        }
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            state: self.state,
            muted: self.muted,
        }
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub fn playback(&self) -> &RemotePlayback {
        &self.playback
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<CallUpdate> {
        self.updates.subscribe()
    }

    /// Applies one event. `Break` carries the shutdown acknowledgement.
    pub async fn handle(&mut self, event: CallEvent) -> ControlFlow<Option<oneshot::Sender<()>>> {
        match event {
            CallEvent::Intent { intent, reply } => {
                let result = self.on_intent(intent).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CallEvent::Signal(envelope) => self.on_signal(envelope).await,
            CallEvent::Peer { generation, event } => self.on_peer_event(generation, event).await,
            CallEvent::Shutdown(reply) => {
                self.hangup().await;
                return ControlFlow::Break(reply);
            }
        }
        ControlFlow::Continue(())
    }

    pub async fn on_intent(&mut self, intent: CallIntent) -> Result<CallStatus, CallError> {
        if intent.is_user_gesture() && self.playback.resume_if_pending() {
            debug!(target = "voice.call", "remote audio resumed");
        }
        match intent {
            CallIntent::StartCall => self.start_call().await,
            CallIntent::ToggleMute => self.toggle_mute(),
            CallIntent::Hangup => Ok(self.hangup().await),
            CallIntent::QueryStatus => Ok(self.status()),
        }
    }

    pub async fn start_call(&mut self) -> Result<CallStatus, CallError> {
        if self.state != CallState::Idle {
            return Err(CallError::Busy);
        }
        match self.engine.start_outgoing().await {
            Ok(()) => {
                self.notify(CallNotice::Calling);
                self.set_state(CallState::Connecting);
                Ok(self.status())
            }
            Err(NegotiationError::MediaUnavailable(err)) => {
                self.notify(CallNotice::MediaUnavailable {
                    reason: err.to_string(),
                });
                Err(CallError::MediaUnavailable(err))
            }
            Err(NegotiationError::AlreadyInCall) => Err(CallError::Busy),
            Err(err) => {
                self.fail(&err).await;
                Err(CallError::Negotiation(err))
            }
        }
    }

    pub fn toggle_mute(&mut self) -> Result<CallStatus, CallError> {
        if !matches!(self.state, CallState::Connecting | CallState::Connected) {
            return Err(CallError::NotInCall);
        }
        let muted = self.engine.toggle_mute().ok_or(CallError::NotInCall)?;
        self.muted = muted;
        info!(target = "voice.call", muted, "microphone toggled");
        self.publish_status();
        Ok(self.status())
    }

    /// Valid in every state; repeated calls are no-ops.
    pub async fn hangup(&mut self) -> CallStatus {
        if self.state != CallState::Idle || self.engine.has_connection() {
            info!(target = "voice.call", state = %self.state, "hanging up");
        }
        self.reset().await;
        self.status()
    }

    pub async fn on_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.is_from(self.engine.signals().local_peer()) {
            trace!(target = "voice.call", "dropping own envelope");
            return;
        }
        let signal = match InboundSignal::from_envelope(&envelope) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(
                    target = "voice.call",
                    from_peer = %envelope.from_peer(),
                    kind = %envelope.kind(),
                    error = %err,
                    "dropping malformed signal"
                );
                return;
            }
        };
        match signal {
            InboundSignal::Offer(offer) => self.on_remote_offer(offer).await,
            InboundSignal::Answer(answer) => match self.engine.on_remote_answer(answer).await {
                Ok(Disposition::Applied) => debug!(target = "voice.call", "remote answer applied"),
                Ok(_) => debug!(target = "voice.call", "stale answer discarded"),
                Err(err) => self.fail(&err).await,
            },
            InboundSignal::Candidate(candidate) => {
                let disposition = self.engine.on_remote_candidate(candidate).await;
                trace!(target = "voice.call", ?disposition, "remote candidate handled");
            }
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        if self.state != CallState::Idle {
            // No busy reply exists on the wire; the caller simply never
            // receives an answer.
            debug!(target = "voice.call", state = %self.state, "rejecting offer while busy");
            return;
        }
        match self.engine.on_remote_offer(offer).await {
            Ok(()) => {
                self.notify(CallNotice::IncomingCall);
                self.set_state(CallState::Connecting);
            }
            Err(NegotiationError::AlreadyInCall) => {
                debug!(target = "voice.call", "rejecting offer while busy");
            }
            Err(NegotiationError::MediaUnavailable(err)) => {
                self.notify(CallNotice::MediaUnavailable {
                    reason: err.to_string(),
                });
            }
            Err(err) => self.fail(&err).await,
        }
    }

    pub async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if !self.engine.is_current(generation) {
            debug!(target = "voice.call", generation, "ignoring event from released connection");
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => self.engine.on_local_candidate(&candidate).await,
            PeerEvent::StateChanged(PeerState::Connecting) => {
                trace!(target = "voice.call", generation, "transport connecting");
            }
            PeerEvent::StateChanged(PeerState::Connected) => {
                if self.state == CallState::Connecting {
                    info!(target = "voice.call", generation, "call connected");
                    self.set_state(CallState::Connected);
                }
            }
            PeerEvent::StateChanged(state @ (PeerState::Disconnected | PeerState::Failed)) => {
                warn!(target = "voice.call", generation, %state, "connection lost");
                self.set_state(CallState::Disconnected);
                self.notify(CallNotice::ConnectionLost);
                self.reset().await;
            }
            PeerEvent::RemoteTrack(track) => self.playback.attach(track),
        }
    }

    async fn fail(&mut self, err: &NegotiationError) {
        warn!(target = "voice.call", error = %err, "call failed");
        self.notify(CallNotice::Failed {
            reason: err.to_string(),
        });
        self.reset().await;
    }

    async fn reset(&mut self) {
        self.engine.teardown().await;
        self.playback.detach();
        self.muted = false;
        self.set_state(CallState::Idle);
    }

    fn set_state(&mut self, state: CallState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let status = self.status();
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            let _ = self.updates.send(CallUpdate::Status(status));
        }
    }

    fn notify(&self, notice: CallNotice) {
        debug!(target = "voice.call", ?notice, "call notice");
        let _ = self.updates.send(CallUpdate::Notice(notice));
    }
}

/// Collaborators for one call endpoint.
pub struct CallSetup {
    pub session_id: String,
    pub local_peer: PeerId,
    pub bus: Arc<dyn SignalBus>,
    pub connector: Arc<dyn PeerConnector>,
    pub capture: Arc<dyn MediaCaptureGateway>,
    pub playback: Arc<dyn PlaybackSink>,
    pub constraints: CaptureConstraints,
}

/// Cloneable handle to a running call actor.
///
/// Intents are queued behind whatever the actor is doing and answered once
/// applied. Dropping every controller stops the actor.
#[derive(Clone)]
pub struct CallController {
    events: mpsc::UnboundedSender<CallEvent>,
    status: watch::Receiver<CallStatus>,
    updates: broadcast::Sender<CallUpdate>,
    session_id: String,
    local_peer: PeerId,
}

impl CallController {
    /// Subscribes to the session and starts the actor on the current runtime.
    /// Returns once the relay delivers everything published from now on.
    pub async fn spawn(setup: CallSetup) -> Result<Self, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let peer_tx = tx.downgrade();
        let peer_events: GenerationEvents = Arc::new(move |generation: u64, event: PeerEvent| {
            if let Some(tx) = peer_tx.upgrade() {
                let _ = tx.send(CallEvent::Peer { generation, event });
            }
        });
        let signals = SignalSender::new(
            Arc::clone(&setup.bus),
            setup.session_id.clone(),
            setup.local_peer.clone(),
        );
        let engine = NegotiationEngine::new(
            setup.connector,
            setup.capture,
            signals,
            setup.constraints,
            peer_events,
        );
        let session = CallSession::new(engine, RemotePlayback::new(setup.playback));

        let signal_tx = tx.downgrade();
        let handler: SignalHandler = Arc::new(move |envelope: SignalEnvelope| {
            if let Some(tx) = signal_tx.upgrade() {
                let _ = tx.send(CallEvent::Signal(envelope));
            }
        });
        let subscription = setup
            .bus
            .subscribe_as(&setup.session_id, &setup.local_peer, handler)
            .await?;

        let controller = Self {
            events: tx,
            status: session.watch_status(),
            updates: session.updates.clone(),
            session_id: setup.session_id,
            local_peer: setup.local_peer,
        };
        info!(
            target = "voice.call",
            session_id = %controller.session_id,
            local_peer = %controller.local_peer,
            "call endpoint started"
        );
        tokio::spawn(run_call_actor(session, rx, subscription));
        Ok(controller)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub async fn start_call(&self) -> Result<CallStatus, CallError> {
        self.request(CallIntent::StartCall).await
    }

    pub async fn toggle_mute(&self) -> Result<CallStatus, CallError> {
        self.request(CallIntent::ToggleMute).await
    }

    /// Returns after the connection and capture are released.
    pub async fn hangup(&self) -> Result<CallStatus, CallError> {
        self.request(CallIntent::Hangup).await
    }

    /// Status after every previously queued event was applied.
    pub async fn current_status(&self) -> Result<CallStatus, CallError> {
        self.request(CallIntent::QueryStatus).await
    }

    /// Last published status, without waiting for queued events.
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<CallUpdate> {
        self.updates.subscribe()
    }

    /// Hangs up, unsubscribes from the relay and stops the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(CallEvent::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, intent: CallIntent) -> Result<CallStatus, CallError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(CallEvent::Intent {
                intent,
                reply: Some(tx),
            })
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }
}

async fn run_call_actor(
    mut session: CallSession,
    mut events: mpsc::UnboundedReceiver<CallEvent>,
    subscription: Subscription,
) {
    let mut ack = None;
    while let Some(event) = events.recv().await {
        if let ControlFlow::Break(reply) = session.handle(event).await {
            ack = reply;
            break;
        }
    }
    if ack.is_none() {
        session.hangup().await;
    }
    subscription.unsubscribe();
    drop(subscription);
    events.close();
    info!(target = "voice.call", "call endpoint stopped");
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CaptureMode, SyntheticCapture};
    use crate::playback::LoggingSink;
    use crate::signaling::IceCandidate;
    use crate::transport::RemoteTrack;
    use crate::transport::mock::MockConnector;
    use serde_json::json;
    use signal_bus::{LocalBus, SignalKind};

    struct Fixture {
        bus: Arc<LocalBus>,
        connector: Arc<MockConnector>,
        capture: Arc<SyntheticCapture>,
        session: CallSession,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(LoggingSink))
    }

    fn fixture_with(sink: Arc<dyn PlaybackSink>) -> Fixture {
        let bus = Arc::new(LocalBus::new());
        let connector = Arc::new(MockConnector::new());
        let capture = Arc::new(SyntheticCapture::new());
        let engine = NegotiationEngine::new(
            connector.clone(),
            capture.clone(),
            SignalSender::new(bus.clone(), "S", PeerId::new("me")),
            CaptureConstraints::default(),
            Arc::new(|_: u64, _: PeerEvent| {}),
        );
        let session = CallSession::new(engine, RemotePlayback::new(sink));
        Fixture {
            bus,
            connector,
            capture,
            session,
        }
    }

    fn envelope(from: &str, kind: SignalKind, payload: serde_json::Value) -> SignalEnvelope {
        SignalEnvelope::new("S", PeerId::new(from), kind, payload)
    }

    fn offer_from(from: &str) -> SignalEnvelope {
        envelope(from, SignalKind::Offer, json!({"type": "offer", "sdp": "remote"}))
    }

    fn drain(rx: &mut broadcast::Receiver<CallUpdate>) -> Vec<CallUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn start_call_moves_to_connecting() {
        let mut f = fixture();
        let mut updates = f.session.subscribe_updates();
        let status = f.session.start_call().await.unwrap();
        assert_eq!(status.state, CallState::Connecting);
        assert_eq!(
            drain(&mut updates),
            vec![
                CallUpdate::Notice(CallNotice::Calling),
                CallUpdate::Status(CallStatus {
                    state: CallState::Connecting,
                    muted: false
                }),
            ]
        );
        assert!(matches!(f.session.start_call().await, Err(CallError::Busy)));
    }

    #[tokio::test]
    async fn denied_microphone_stays_idle_with_notice() {
        let mut f = fixture();
        f.capture.set_mode(CaptureMode::Deny);
        let mut updates = f.session.subscribe_updates();
        assert!(matches!(
            f.session.start_call().await,
            Err(CallError::MediaUnavailable(CaptureError::PermissionDenied(_)))
        ));
        assert_eq!(f.session.status(), CallStatus::IDLE);
        assert!(matches!(
            drain(&mut updates).as_slice(),
            [CallUpdate::Notice(CallNotice::MediaUnavailable { .. })]
        ));
        assert!(f.bus.history("S").is_empty());
    }

    #[tokio::test]
    async fn inbound_offer_while_idle_is_answered() {
        let mut f = fixture();
        let mut updates = f.session.subscribe_updates();
        f.session.on_signal(offer_from("them")).await;
        assert_eq!(f.session.status().state, CallState::Connecting);
        assert_eq!(drain(&mut updates)[0], CallUpdate::Notice(CallNotice::IncomingCall));
        let kinds: Vec<_> = f.bus.history("S").iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![SignalKind::Answer]);
    }

    #[tokio::test]
    async fn glare_offer_leaves_call_untouched() {
        let mut f = fixture();
        f.session.start_call().await.unwrap();
        let generation = f.session.engine().generation();
        f.session.on_signal(offer_from("them")).await;
        assert_eq!(f.session.status().state, CallState::Connecting);
        assert!(f.session.engine().is_current(generation));
        assert_eq!(f.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn own_envelopes_are_ignored() {
        let mut f = fixture();
        f.session.on_signal(offer_from("me")).await;
        assert_eq!(f.session.status(), CallStatus::IDLE);
        assert_eq!(f.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn malformed_signal_is_dropped() {
        let mut f = fixture();
        f.session
            .on_signal(envelope("them", SignalKind::Offer, json!({"sdp": 5})))
            .await;
        assert_eq!(f.session.status(), CallStatus::IDLE);
    }

    #[tokio::test]
    async fn transport_failure_returns_to_idle_and_releases_media() {
        let mut f = fixture();
        f.session.start_call().await.unwrap();
        f.session
            .on_signal(envelope(
                "them",
                SignalKind::Answer,
                json!({"type": "answer", "sdp": "remote"}),
            ))
            .await;
        let generation = f.session.engine().generation();
        f.session
            .on_peer_event(generation, PeerEvent::StateChanged(PeerState::Connected))
            .await;
        assert_eq!(f.session.status().state, CallState::Connected);
        let track = f.session.engine().connection().unwrap().tracks()[0].clone();

        let mut updates = f.session.subscribe_updates();
        f.session
            .on_peer_event(generation, PeerEvent::StateChanged(PeerState::Failed))
            .await;
        assert_eq!(
            drain(&mut updates),
            vec![
                CallUpdate::Status(CallStatus {
                    state: CallState::Disconnected,
                    muted: false
                }),
                CallUpdate::Notice(CallNotice::ConnectionLost),
                CallUpdate::Status(CallStatus::IDLE),
            ]
        );
        assert!(!f.session.engine().has_connection());
        assert!(track.is_stopped());
        assert_eq!(f.capture.active_captures(), 0);
    }

    #[tokio::test]
    async fn events_from_released_connection_are_ignored() {
        let mut f = fixture();
        f.session.start_call().await.unwrap();
        let stale = f.session.engine().generation();
        f.session.hangup().await;
        f.session.start_call().await.unwrap();
        f.session
            .on_peer_event(stale, PeerEvent::StateChanged(PeerState::Failed))
            .await;
        f.session
            .on_peer_event(stale, PeerEvent::LocalCandidate(IceCandidate::new("old")))
            .await;
        assert_eq!(f.session.status().state, CallState::Connecting);
        assert!(f.session.engine().has_connection());
        let candidates = f
            .bus
            .history("S")
            .iter()
            .filter(|e| e.kind() == SignalKind::Candidate)
            .count();
        assert_eq!(candidates, 0);
    }

    #[tokio::test]
    async fn mute_requires_a_call_and_never_signals() {
        let mut f = fixture();
        assert!(matches!(f.session.toggle_mute(), Err(CallError::NotInCall)));
        f.session.start_call().await.unwrap();
        let published = f.bus.history("S").len();
        assert!(f.session.toggle_mute().unwrap().muted);
        assert!(!f.session.toggle_mute().unwrap().muted);
        assert_eq!(f.bus.history("S").len(), published);
    }

    #[tokio::test]
    async fn hangup_from_idle_is_a_no_op() {
        let mut f = fixture();
        let mut updates = f.session.subscribe_updates();
        assert_eq!(f.session.hangup().await, CallStatus::IDLE);
        assert_eq!(f.session.hangup().await, CallStatus::IDLE);
        assert!(drain(&mut updates).is_empty());
    }

    #[tokio::test]
    async fn hangup_resets_mute() {
        let mut f = fixture();
        f.session.start_call().await.unwrap();
        f.session.toggle_mute().unwrap();
        assert_eq!(f.session.hangup().await, CallStatus::IDLE);
    }

    #[tokio::test]
    async fn remote_track_is_attached_and_detached() {
        let mut f = fixture();
        f.session.start_call().await.unwrap();
        let generation = f.session.engine().generation();
        f.session
            .on_peer_event(
                generation,
                PeerEvent::RemoteTrack(RemoteTrack {
                    id: "t".into(),
                    stream_id: "s".into(),
                }),
            )
            .await;
        assert!(f.session.playback().current().is_some());
        f.session.hangup().await;
        assert!(f.session.playback().current().is_none());
    }

    /// Refuses the first start like an autoplay policy would.
    #[derive(Default)]
    struct AutoplayBlockedSink {
        plays: parking_lot::Mutex<u32>,
    }

    impl PlaybackSink for AutoplayBlockedSink {
        fn play(&self, _track: &RemoteTrack) -> Result<(), crate::playback::PlaybackError> {
            let mut plays = self.plays.lock();
            *plays += 1;
            if *plays == 1 {
                return Err(crate::playback::PlaybackError::Blocked("autoplay".into()));
            }
            Ok(())
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn status_queries_do_not_consume_the_playback_retry() {
        let sink = Arc::new(AutoplayBlockedSink::default());
        let mut f = fixture_with(sink.clone());
        f.session.start_call().await.unwrap();
        let generation = f.session.engine().generation();
        f.session
            .on_peer_event(
                generation,
                PeerEvent::RemoteTrack(RemoteTrack {
                    id: "t".into(),
                    stream_id: "s".into(),
                }),
            )
            .await;
        assert!(f.session.playback().is_pending_resume());

        f.session.on_intent(CallIntent::QueryStatus).await.unwrap();
        f.session.on_intent(CallIntent::QueryStatus).await.unwrap();
        assert!(f.session.playback().is_pending_resume());
        assert_eq!(*sink.plays.lock(), 1);

        f.session.on_intent(CallIntent::ToggleMute).await.unwrap();
        assert!(!f.session.playback().is_pending_resume());
        assert_eq!(*sink.plays.lock(), 2);
    }

    #[tokio::test]
    async fn candidates_before_offer_are_applied_after_answer() {
        let mut f = fixture();
        f.session
            .on_signal(envelope(
                "them",
                SignalKind::Candidate,
                json!({"candidate": "c1", "sdpMid": "0", "sdpMLineIndex": 0}),
            ))
            .await;
        assert_eq!(f.session.engine().pending_candidates(), 1);
        f.session.on_signal(offer_from("them")).await;
        let peer = f.connector.last_peer().unwrap();
        let applied: Vec<_> = peer
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["c1"]);
        assert_eq!(
            peer.remote_description(),
            Some(SessionDescription::offer("remote"))
        );
    }
}

//! In-process peer connections that only record what was asked of them.
//!
//! Tests drive transport events by hand through [`MockPeer::emit`], inject
//! failures per [`Step`], and can hold any step open with [`MockConnector::pause`]
//! to interleave other work while it is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventCallback};
use crate::media::LocalAudioTrack;
use crate::signaling::{DescriptionKind, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Connect,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    AddTrack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(DescriptionKind),
    SetRemote(DescriptionKind),
    AddCandidate(String),
    AddTrack(String),
    Close,
}

/// A step held open until [`StepPause::release`] is called.
#[derive(Debug, Clone)]
pub struct StepPause {
    reached: Arc<Notify>,
    resume: Arc<Notify>,
}

impl StepPause {
    /// Resolves once the paused step has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.resume.notify_one();
    }
}

#[derive(Default)]
struct Script {
    failures: Mutex<HashSet<Step>>,
    pauses: Mutex<HashMap<Step, StepPause>>,
}

impl Script {
    /// Applies the pause (once) and failure configured for `step`.
    async fn run(&self, step: Step) -> Result<(), PeerError> {
        let pause = self.pauses.lock().remove(&step);
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.resume.notified().await;
        }
        if self.failures.lock().contains(&step) {
            return Err(PeerError::Negotiation(format!("scripted failure at {step:?}")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockConnector {
    script: Arc<Script>,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    next_id: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `step` fail until [`MockConnector::clear_failures`].
    pub fn fail(&self, step: Step) {
        self.script.failures.lock().insert(step);
    }

    pub fn clear_failures(&self) {
        self.script.failures.lock().clear();
    }

    /// Holds the next `step` open until released.
    pub fn pause(&self, step: Step) -> StepPause {
        let pause = StepPause {
            reached: Arc::new(Notify::new()),
            resume: Arc::new(Notify::new()),
        };
        self.script.pauses.lock().insert(step, pause.clone());
        pause
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Connections that have not been closed.
    pub fn open_peers(&self) -> usize {
        self.peers.lock().iter().filter(|peer| !peer.is_closed()).count()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, events: PeerEventCallback) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.script.run(Step::Connect).await?;
        let peer = Arc::new(MockPeer {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            events,
            script: Arc::clone(&self.script),
            ops: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct MockPeer {
    id: usize,
    events: PeerEventCallback,
    script: Arc<Script>,
    ops: Mutex<Vec<PeerOp>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<LocalAudioTrack>>,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Delivers `event` exactly as the transport would.
    pub fn emit(&self, event: PeerEvent) {
        (self.events)(event);
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    /// Candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn tracks(&self) -> Vec<LocalAudioTrack> {
        self.tracks.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::CreateOffer);
        self.script.run(Step::CreateOffer).await?;
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::CreateAnswer);
        self.script.run(Step::CreateAnswer).await?;
        if self.remote.lock().is_none() {
            return Err(PeerError::Negotiation("answer requested without remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::SetLocal(description.kind));
        self.script.run(Step::SetLocalDescription).await?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::SetRemote(description.kind));
        self.script.run(Step::SetRemoteDescription).await?;
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::AddCandidate(candidate.candidate.clone()));
        self.script.run(Step::AddIceCandidate).await?;
        // Browsers reject candidates that arrive before a remote description.
        if self.remote.lock().is_none() {
            return Err(PeerError::Negotiation(
                "candidate applied without remote description".into(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalAudioTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::AddTrack(track.id().to_owned()));
        self.script.run(Step::AddTrack).await?;
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(PeerOp::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerState;

    fn noop() -> PeerEventCallback {
        Arc::new(|_: PeerEvent| {})
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_rejected() {
        let connector = MockConnector::new();
        let peer = connector.connect(noop()).await.unwrap();
        assert!(peer.add_ice_candidate(IceCandidate::new("c1")).await.is_err());
        peer.set_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();
        peer.add_ice_candidate(IceCandidate::new("c2")).await.unwrap();
        let mock = connector.last_peer().unwrap();
        assert_eq!(mock.applied_candidates(), vec![IceCandidate::new("c2")]);
    }

    #[tokio::test]
    async fn scripted_failure_applies_to_one_step() {
        let connector = MockConnector::new();
        connector.fail(Step::CreateOffer);
        let peer = connector.connect(noop()).await.unwrap();
        assert!(peer.create_offer().await.is_err());
        connector.clear_failures();
        assert!(peer.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn close_is_recorded_once() {
        let connector = MockConnector::new();
        let peer = connector.connect(noop()).await.unwrap();
        peer.close().await;
        peer.close().await;
        let mock = connector.last_peer().unwrap();
        assert_eq!(mock.ops(), vec![PeerOp::Close]);
        assert_eq!(connector.open_peers(), 0);
        assert!(matches!(peer.create_offer().await, Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn emitted_events_reach_the_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let connector = MockConnector::new();
        connector
            .connect(Arc::new(move |event: PeerEvent| sink.lock().push(event)))
            .await
            .unwrap();
        connector
            .last_peer()
            .unwrap()
            .emit(PeerEvent::StateChanged(PeerState::Connected));
        assert_eq!(
            seen.lock().as_slice(),
            &[PeerEvent::StateChanged(PeerState::Connected)]
        );
    }

    #[tokio::test]
    async fn paused_step_waits_for_release() {
        let connector = Arc::new(MockConnector::new());
        let pause = connector.pause(Step::CreateOffer);
        let peer = connector.connect(noop()).await.unwrap();
        let task = tokio::spawn(async move { peer.create_offer().await });
        pause.reached().await;
        assert!(!task.is_finished());
        pause.release();
        assert!(task.await.unwrap().is_ok());
    }
}

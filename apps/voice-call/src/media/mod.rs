use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no usable audio input: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// A live local audio source. Clones share the enabled and stopped flags.
#[derive(Debug, Clone)]
pub struct LocalAudioTrack {
    id: String,
    state: Arc<TrackState>,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Whether samples should currently flow out of this track.
    pub fn is_producing(&self) -> bool {
        self.is_enabled() && !self.is_stopped()
    }
}

/// Result of one successful acquisition.
#[derive(Debug)]
pub struct CaptureHandle {
    id: u64,
    tracks: Vec<LocalAudioTrack>,
}

impl CaptureHandle {
    pub fn new(id: u64, tracks: Vec<LocalAudioTrack>) -> Self {
        Self { id, tracks }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tracks(&self) -> &[LocalAudioTrack] {
        &self.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Access to the local microphone.
#[async_trait]
pub trait MediaCaptureGateway: Send + Sync {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureHandle, CaptureError>;

    /// Stops every track of `handle`. Releasing twice is a no-op.
    fn release(&self, handle: &CaptureHandle);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureMode {
    #[default]
    Allow,
    Deny,
    Unavailable,
}

/// Device-free capture source: every acquisition yields one silent track.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    mode: Mutex<CaptureMode>,
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: CaptureMode) -> Self {
        let capture = Self::default();
        capture.set_mode(mode);
        capture
    }

    pub fn set_mode(&self, mode: CaptureMode) {
        *self.mode.lock() = mode;
    }

    /// Acquisitions that have not been released yet.
    pub fn active_captures(&self) -> usize {
        self.live.lock().len()
    }

    pub fn total_acquired(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCaptureGateway for SyntheticCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureHandle, CaptureError> {
        match *self.mode.lock() {
            CaptureMode::Allow => {}
            CaptureMode::Deny => {
                return Err(CaptureError::PermissionDenied("user dismissed the prompt".into()));
            }
            CaptureMode::Unavailable => {
                return Err(CaptureError::DeviceUnavailable("no input device present".into()));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let track = LocalAudioTrack::new(format!("audio-{id}"));
        self.live.lock().insert(id);
        debug!(target = "voice.call", capture_id = id, ?constraints, "capture acquired");
        Ok(CaptureHandle::new(id, vec![track]))
    }

    fn release(&self, handle: &CaptureHandle) {
        handle.stop_all();
        if self.live.lock().remove(&handle.id()) {
            debug!(target = "voice.call", capture_id = handle.id(), "capture released");
        }
    }
}

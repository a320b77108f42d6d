use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::RemoteTrack;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// Output refused until the user interacts (autoplay policies).
    #[error("playback blocked until user interaction: {0}")]
    Blocked(String),
    #[error("audio output unavailable: {0}")]
    Device(String),
}

/// Audio output for the remote participant.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, track: &RemoteTrack) -> Result<(), PlaybackError>;

    fn stop(&self);
}

/// Sink that only reports what it would play.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl PlaybackSink for LoggingSink {
    fn play(&self, track: &RemoteTrack) -> Result<(), PlaybackError> {
        info!(
            target = "voice.call",
            track_id = %track.id,
            stream_id = %track.stream_id,
            "remote audio playing"
        );
        Ok(())
    }

    fn stop(&self) {
        debug!(target = "voice.call", "remote audio stopped");
    }
}

/// Routes the remote track to a sink. A refused start leaves a pending
/// resume that the next user intent retries exactly once.
pub struct RemotePlayback {
    sink: Arc<dyn PlaybackSink>,
    current: Option<RemoteTrack>,
    pending_resume: bool,
}

impl RemotePlayback {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            current: None,
            pending_resume: false,
        }
    }

    pub fn attach(&mut self, track: RemoteTrack) {
        match self.sink.play(&track) {
            Ok(()) => self.pending_resume = false,
            Err(PlaybackError::Blocked(reason)) => {
                warn!(target = "voice.call", %reason, "remote audio blocked; will retry on next action");
                self.pending_resume = true;
            }
            Err(err) => {
                warn!(target = "voice.call", error = %err, "remote audio failed to start");
                self.pending_resume = false;
            }
        }
        self.current = Some(track);
    }

    /// Consumes the pending flag; returns whether playback started.
    pub fn resume_if_pending(&mut self) -> bool {
        if !std::mem::take(&mut self.pending_resume) {
            return false;
        }
        let Some(track) = &self.current else {
            return false;
        };
        match self.sink.play(track) {
            Ok(()) => true,
            Err(err) => {
                debug!(target = "voice.call", error = %err, "remote audio resume failed");
                false
            }
        }
    }

    pub fn detach(&mut self) {
        self.pending_resume = false;
        if self.current.take().is_some() {
            self.sink.stop();
        }
    }

    pub fn is_pending_resume(&self) -> bool {
        self.pending_resume
    }

    pub fn current(&self) -> Option<&RemoteTrack> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedSink {
        outcomes: Mutex<VecDeque<Result<(), PlaybackError>>>,
        plays: Mutex<u32>,
        stops: Mutex<u32>,
    }

    impl ScriptedSink {
        fn with(outcomes: Vec<Result<(), PlaybackError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }
    }

    impl PlaybackSink for ScriptedSink {
        fn play(&self, _track: &RemoteTrack) -> Result<(), PlaybackError> {
            *self.plays.lock() += 1;
            self.outcomes.lock().pop_front().unwrap_or(Ok(()))
        }

        fn stop(&self) {
            *self.stops.lock() += 1;
        }
    }

    fn track() -> RemoteTrack {
        RemoteTrack {
            id: "remote-audio".into(),
            stream_id: "stream".into(),
        }
    }

    #[test]
    fn blocked_start_is_retried_by_next_intent_only() {
        let sink = ScriptedSink::with(vec![Err(PlaybackError::Blocked("autoplay".into()))]);
        let mut playback = RemotePlayback::new(sink.clone());
        playback.attach(track());
        assert!(playback.is_pending_resume());
        assert!(playback.resume_if_pending());
        assert!(!playback.resume_if_pending());
        assert_eq!(*sink.plays.lock(), 2);
    }

    #[test]
    fn failed_retry_is_not_rearmed() {
        let sink = ScriptedSink::with(vec![
            Err(PlaybackError::Blocked("autoplay".into())),
            Err(PlaybackError::Blocked("still".into())),
        ]);
        let mut playback = RemotePlayback::new(sink.clone());
        playback.attach(track());
        assert!(!playback.resume_if_pending());
        assert!(!playback.is_pending_resume());
        assert!(!playback.resume_if_pending());
        assert_eq!(*sink.plays.lock(), 2);
    }

    #[test]
    fn detach_stops_and_clears_pending() {
        let sink = ScriptedSink::with(vec![Err(PlaybackError::Blocked("autoplay".into()))]);
        let mut playback = RemotePlayback::new(sink.clone());
        playback.attach(track());
        playback.detach();
        playback.detach();
        assert!(!playback.is_pending_resume());
        assert!(playback.current().is_none());
        assert_eq!(*sink.stops.lock(), 1);
    }
}

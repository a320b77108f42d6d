use std::collections::VecDeque;

use crate::signaling::IceCandidate;

/// Remote candidates that arrived before a remote description was set.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Hands back everything queued, oldest first, once a remote description
    /// exists. Otherwise the queue is left untouched.
    pub fn drain_if_ready(&mut self, has_remote_description: bool) -> Vec<IceCandidate> {
        if !has_remote_description {
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn purge(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

//! Call negotiation and lifecycle.
//!
//! [`CallController`] is the public surface: it spawns one actor per call
//! endpoint that owns a [`CallSession`], which in turn drives the
//! [`NegotiationEngine`].

mod candidate_queue;
mod lifecycle;
mod negotiation;

pub use candidate_queue::CandidateQueue;
pub use lifecycle::{
    CallController, CallError, CallEvent, CallIntent, CallNotice, CallSession, CallSetup,
    CallState, CallStatus, CallUpdate, IntentReply,
};
pub use negotiation::{
    ConnectionHandle, Disposition, GenerationEvents, NegotiationEngine, NegotiationError,
    NegotiationState,
};

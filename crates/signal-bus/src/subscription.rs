use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{PeerId, SignalEnvelope};

/// Callback invoked for every envelope delivered on a subscription.
///
/// Handlers run on the bus pump task and must not call `unsubscribe` on
/// their own subscription.
pub type SignalHandler = Arc<dyn Fn(SignalEnvelope) + Send + Sync>;

/// Wraps `handler` so envelopes published by `local_peer` never reach it.
pub fn filter_self_echo(local_peer: PeerId, handler: SignalHandler) -> SignalHandler {
    Arc::new(move |envelope: SignalEnvelope| {
        if envelope.is_from(&local_peer) {
            return;
        }
        handler(envelope);
    })
}

/// Open/closed switch shared between a subscription handle and its pump.
///
/// Delivery holds the lock for the whole handler call, so closing waits for
/// an in-progress delivery and no delivery starts afterwards.
#[derive(Debug)]
pub(crate) struct DeliveryGate {
    open: Mutex<bool>,
}

impl DeliveryGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(true),
        })
    }

    /// Returns false once the gate has been closed.
    pub(crate) fn deliver(&self, handler: &SignalHandler, envelope: SignalEnvelope) -> bool {
        let open = self.open.lock();
        if !*open {
            return false;
        }
        handler(envelope);
        true
    }

    pub(crate) fn close(&self) -> bool {
        let mut open = self.open.lock();
        std::mem::replace(&mut *open, false)
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

/// Handle to a live subscription. Dropping it unsubscribes.
pub struct Subscription {
    session_id: String,
    gate: Arc<DeliveryGate>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(
        session_id: impl Into<String>,
        gate: Arc<DeliveryGate>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            gate,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stops delivery. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.gate.close() {
            debug!(
                target = "signal.bus",
                session_id = %self.session_id,
                "subscription closed"
            );
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish()
    }
}

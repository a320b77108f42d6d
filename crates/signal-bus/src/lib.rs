use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

mod envelope;
#[cfg(feature = "redis")]
mod redis_relay;
mod subscription;

pub use envelope::{PeerId, SignalEnvelope, SignalKind};
#[cfg(feature = "redis")]
pub use redis_relay::RedisBus;
pub use subscription::{filter_self_echo, SignalHandler, Subscription};

use subscription::DeliveryGate;

const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

/// Fan-out relay for signaling envelopes, keyed by session id.
///
/// Delivery is at-least-once and in publish order per sender; nothing is
/// promised about ordering across senders. A subscription sees every
/// envelope published after `subscribe` returned.
#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn publish(&self, envelope: SignalEnvelope) -> BusResult<()>;

    async fn subscribe(&self, session_id: &str, handler: SignalHandler) -> BusResult<Subscription>;

    /// Subscribes with self-echo suppression for `local_peer`.
    async fn subscribe_as(
        &self,
        session_id: &str,
        local_peer: &PeerId,
        handler: SignalHandler,
    ) -> BusResult<Subscription> {
        self.subscribe(session_id, filter_self_echo(local_peer.clone(), handler))
            .await
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }
}

type SessionLog = Arc<RwLock<HashMap<String, Vec<SignalEnvelope>>>>;

/// In-process relay for tests, demos and single-process deployments.
///
/// Every published envelope is appended to a per-session log before it is
/// fanned out, matching the insert-then-notify shape of a hosted relay. A
/// subscriber that falls behind the fan-out channel catches up from the log.
#[derive(Debug, Default)]
pub struct LocalBus {
    sessions: RwLock<HashMap<String, broadcast::Sender<SignalEnvelope>>>,
    log: SessionLog,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, session_id: &str) -> broadcast::Sender<SignalEnvelope> {
        let mut guard = self.sessions.write();
        guard
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Everything published for `session_id`, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<SignalEnvelope> {
        self.log.read().get(session_id).cloned().unwrap_or_default()
    }

    /// Marks the relay unavailable. Later publishes fail and live
    /// subscriptions stop receiving.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sessions.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Log entries `[from, from + count)` of one session.
fn logged_range(log: &SessionLog, session_id: &str, from: usize, count: usize) -> Vec<SignalEnvelope> {
    log.read()
        .get(session_id)
        .and_then(|entries| entries.get(from..from + count))
        .map(<[SignalEnvelope]>::to_vec)
        .unwrap_or_default()
}

#[async_trait]
impl SignalBus for LocalBus {
    async fn publish(&self, envelope: SignalEnvelope) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let sender = self.sender_for(envelope.session_id());
        // Append and fan out under one lock so log positions match the
        // channel order every subscriber sees.
        let mut log = self.log.write();
        log.entry(envelope.session_id().to_string())
            .or_default()
            .push(envelope.clone());
        trace!(
            target = "signal.bus",
            session_id = %envelope.session_id(),
            from_peer = %envelope.from_peer(),
            kind = %envelope.kind(),
            "envelope published"
        );
        // No live subscribers is not an error: the log still records it.
        let _ = sender.send(envelope);
        Ok(())
    }

    async fn subscribe(&self, session_id: &str, handler: SignalHandler) -> BusResult<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (mut rx, mut cursor) = {
            let log = self.log.read();
            let cursor = log.get(session_id).map_or(0, Vec::len);
            (self.sender_for(session_id).subscribe(), cursor)
        };
        let log = Arc::clone(&self.log);
        let gate = DeliveryGate::new();
        let pump_gate = Arc::clone(&gate);
        let topic = session_id.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        cursor += 1;
                        if !pump_gate.deliver(&handler, envelope) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let skipped = skipped as usize;
                        debug!(
                            target = "signal.bus",
                            session_id = %topic,
                            skipped,
                            "subscriber lagged; replaying from session log"
                        );
                        let missed = logged_range(&log, &topic, cursor, skipped);
                        cursor += skipped;
                        for envelope in missed {
                            if !pump_gate.deliver(&handler, envelope) {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Subscription::new(session_id, gate, pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collecting_handler() -> (SignalHandler, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: SignalHandler = Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        });
        (handler, rx)
    }

    fn offer_from(peer: &str, n: u64) -> SignalEnvelope {
        SignalEnvelope::new(
            "S1",
            PeerId::new(peer),
            SignalKind::Offer,
            json!({"type": "offer", "sdp": format!("v={n}")}),
        )
    }

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let _sub = bus.subscribe("S1", handler).await.expect("subscribe ok");
        bus.publish(offer_from("a", 0)).await.expect("publish ok");
        let msg = rx.recv().await.expect("receive ok");
        assert_eq!(msg.session_id(), "S1");
        assert_eq!(msg.kind(), SignalKind::Offer);
    }

    #[tokio::test]
    async fn subscribe_as_drops_own_envelopes() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let me = PeerId::new("me");
        let _sub = bus.subscribe_as("S1", &me, handler).await.unwrap();
        bus.publish(offer_from("me", 1)).await.unwrap();
        bus.publish(offer_from("them", 2)).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.from_peer().as_str(), "them");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let _sub = bus.subscribe("other", handler).await.unwrap();
        bus.publish(offer_from("a", 0)).await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "envelope leaked across sessions");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let sub = bus.subscribe("S1", handler).await.unwrap();
        bus.unsubscribe(&sub);
        sub.unsubscribe();
        assert!(!sub.is_active());
        bus.publish(offer_from("a", 0)).await.unwrap();
        // The pump dropped its handler, so the channel closes without a value.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let _sub = bus.subscribe("S1", handler).await.unwrap();
        for n in 0..20 {
            bus.publish(offer_from("a", n)).await.unwrap();
        }
        for n in 0..20 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload()["sdp"], format!("v={n}"));
        }
    }

    #[tokio::test]
    async fn history_is_append_only_per_session() {
        let bus = LocalBus::new();
        bus.publish(offer_from("a", 0)).await.unwrap();
        bus.publish(offer_from("b", 1)).await.unwrap();
        let history = bus.history("S1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_peer().as_str(), "a");
        assert_eq!(history[1].from_peer().as_str(), "b");
        assert!(bus.history("S2").is_empty());
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = LocalBus::new();
        bus.close();
        assert!(matches!(bus.publish(offer_from("a", 0)).await, Err(BusError::Closed)));
        let (handler, _rx) = collecting_handler();
        assert!(matches!(bus.subscribe("S1", handler).await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn burst_larger_than_channel_is_delivered_in_order() {
        let bus = LocalBus::new();
        let (handler, mut rx) = collecting_handler();
        let _sub = bus.subscribe("S1", handler).await.unwrap();
        let burst = SESSION_CHANNEL_CAPACITY as u64 + 44;
        // The pump cannot run until this task yields, so the channel overflows.
        for n in 0..burst {
            bus.publish(offer_from("a", n)).await.unwrap();
        }
        for n in 0..burst {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload()["sdp"], format!("v={n}"));
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(extra.is_err(), "envelope delivered twice");
    }

    #[tokio::test]
    async fn envelopes_before_subscribe_are_not_delivered() {
        let bus = LocalBus::new();
        bus.publish(offer_from("a", 0)).await.unwrap();
        let (handler, mut rx) = collecting_handler();
        let _sub = bus.subscribe("S1", handler).await.unwrap();
        bus.publish(offer_from("a", 1)).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload()["sdp"], "v=1");
    }
}

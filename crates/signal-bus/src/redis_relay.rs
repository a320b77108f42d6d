use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult, Value};
use tracing::{debug, error, trace, warn};

use crate::subscription::DeliveryGate;
use crate::{BusError, BusResult, SignalBus, SignalEnvelope, SignalHandler, Subscription};

const KEY_PREFIX: &str = "voice:signals";
const PAYLOAD_FIELD: &str = "payload";
const STREAM_RETENTION: usize = 1_000;
const READ_BATCH: usize = 64;
const READ_BLOCK: Duration = Duration::from_secs(1);
const MAX_READ_FAILURES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
// Stream ids are always greater than this, so an empty stream reads from the start.
const STREAM_START: &str = "0-0";

fn session_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}:{session_id}")
}

fn to_transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

/// Relay backed by one Redis stream per session.
///
/// `subscribe` records the id of the newest entry before it returns and the
/// reader moves forward from there, so envelopes published while the reader
/// starts or reconnects are still delivered.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(to_transport)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(to_transport)?;
        debug!(target = "signal.bus", url, "redis relay connected");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl SignalBus for RedisBus {
    async fn publish(&self, envelope: SignalEnvelope) -> BusResult<()> {
        let key = session_key(envelope.session_id());
        let payload = envelope.encode()?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                &key,
                StreamMaxlen::Approx(STREAM_RETENTION),
                "*",
                &[(PAYLOAD_FIELD, payload.as_ref())],
            )
            .await
            .map_err(to_transport)?;
        trace!(
            target = "signal.bus",
            session_id = %envelope.session_id(),
            kind = %envelope.kind(),
            %id,
            "envelope published"
        );
        Ok(())
    }

    async fn subscribe(&self, session_id: &str, handler: SignalHandler) -> BusResult<Subscription> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();
        let newest: StreamRangeReply = conn
            .xrevrange_count(&key, "+", "-", 1)
            .await
            .map_err(to_transport)?;
        let cursor = newest
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| STREAM_START.to_string());
        // Blocking reads get their own connection so publishes never queue
        // behind them.
        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(to_transport)?;

        let gate = DeliveryGate::new();
        let stream = StreamReader {
            client: self.client.clone(),
            conn: reader,
            key,
            cursor,
            handler,
            gate: Arc::clone(&gate),
        };
        let pump = tokio::spawn(stream.run());
        Ok(Subscription::new(session_id, gate, pump))
    }
}

struct StreamReader {
    client: redis::Client,
    conn: MultiplexedConnection,
    key: String,
    cursor: String,
    handler: SignalHandler,
    gate: Arc<DeliveryGate>,
}

impl StreamReader {
    async fn run(mut self) {
        let options = StreamReadOptions::default()
            .count(READ_BATCH)
            .block(READ_BLOCK.as_millis() as usize);
        let mut failures = 0u32;
        loop {
            let reply: RedisResult<Option<StreamReadReply>> = self
                .conn
                .xread_options(&[&self.key], &[&self.cursor], &options)
                .await;
            match reply {
                Ok(reply) => {
                    failures = 0;
                    let entries = reply
                        .into_iter()
                        .flat_map(|reply| reply.keys)
                        .flat_map(|stream| stream.ids);
                    for entry in entries {
                        self.cursor = entry.id;
                        let Some(envelope) = decode_entry(&entry.map) else {
                            warn!(
                                target = "signal.bus",
                                key = %self.key,
                                id = %self.cursor,
                                "dropping malformed stream entry"
                            );
                            continue;
                        };
                        if !self.gate.deliver(&self.handler, envelope) {
                            return;
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= MAX_READ_FAILURES {
                        error!(
                            target = "signal.bus",
                            key = %self.key,
                            error = %err,
                            "redis relay unreachable; closing subscription"
                        );
                        self.gate.close();
                        return;
                    }
                    warn!(
                        target = "signal.bus",
                        key = %self.key,
                        failures,
                        error = %err,
                        "redis read failed; reconnecting"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * failures).await;
                    match self.client.get_multiplexed_async_connection().await {
                        Ok(conn) => self.conn = conn,
                        Err(err) => {
                            warn!(target = "signal.bus", error = %err, "redis reconnect failed")
                        }
                    }
                }
            }
        }
    }
}

fn decode_entry(fields: &HashMap<String, Value>) -> Option<SignalEnvelope> {
    let raw = fields.get(PAYLOAD_FIELD)?;
    let bytes: Vec<u8> = redis::from_redis_value(raw).ok()?;
    SignalEnvelope::decode(&bytes).ok()
}

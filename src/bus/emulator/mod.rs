//! In-process Kafka emulator.
//!
//! Uses one tokio broadcast channel per topic for pub/sub within a single
//! process. Ideal for local development and testing without a broker.
//!
//! A published message is an encoded [`Envelope`] whose id is the message
//! key, whose headers are the broker headers and whose body is the raw
//! value. Every subscriber of a topic receives every message regardless of
//! consumer group; messages published before a subscriber exists are lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BusError, InboundRecord, Result};
use crate::envelope::{Body, Envelope};

/// Channel capacity per topic.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process topic emulator. Clones share the same topics.
#[derive(Clone, Default)]
pub struct Emulator {
    inner: Arc<EmulatorInner>,
}

#[derive(Default)]
struct EmulatorInner {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `NotReady` once the emulator has been shut down.
    pub fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::NotReady("Kafka emulator".to_string()));
        }
        Ok(())
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a message; returns the number of subscribers reached.
    pub fn publish(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<usize> {
        self.ensure_open()?;

        let mut message = Envelope::new().with_headers(headers).with_body(value);
        message.id = key.to_string();

        // No receivers is fine, the event is simply not observed.
        let receivers = self.sender(topic).send(message.to_bytes()).unwrap_or(0);
        debug!(topic = %topic, receivers, "Published to emulator");
        Ok(receivers)
    }

    /// Attach a listener to a topic.
    pub fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>> {
        self.ensure_open()?;
        Ok(self.sender(topic).subscribe())
    }

    /// Close every topic; listeners observe end of stream.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// Rebuild the broker record of an emulator message.
///
/// `offset` is the per-listener sequence number.
pub fn record_from_message(topic: &str, message: &[u8], offset: i64) -> Option<InboundRecord> {
    let envelope = Envelope::from_bytes(message).ok()?;
    let value = match envelope.body {
        Some(Body::Bytes(raw)) => Some(raw),
        Some(body @ Body::Value(_)) => Some(super::serialize_payload(&body)),
        None => None,
    };
    Some(InboundRecord {
        topic: topic.to_string(),
        partition: 0,
        key: Some(envelope.id.into_bytes()),
        value,
        headers: envelope.headers,
        offset,
    })
}

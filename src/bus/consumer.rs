//! Consumer wrapper: one consumer group subscribed to one topic.
//!
//! `subscribe` returns a [`Subscription`], a lazy unbounded stream of
//! [`InboundRecord`]s. Dropping or cancelling the subscription stops the
//! pump task feeding it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::emulator::record_from_message;
use super::{BrokerClient, BusError, Emulator, InboundRecord, Result};
use crate::envelope::{new_id, Envelope};

#[cfg(feature = "kafka")]
use super::kafka::{self, KafkaClient};
#[cfg(feature = "kafka")]
use rdkafka::consumer::{Consumer, StreamConsumer};
#[cfg(feature = "kafka")]
use std::sync::Arc;

/// Acknowledgement counters of one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckStats {
    pub acks: u64,
    pub nacks: u64,
    pub rejections: u64,
}

enum Backend {
    Emulator(Emulator),
    #[cfg(feature = "kafka")]
    Kafka {
        client: KafkaClient,
        consumer: Option<Arc<StreamConsumer>>,
    },
}

/// Consumer over either broker variant.
pub struct ConsumerWrapper {
    id: String,
    group: String,
    backend: Backend,
    connected: bool,
    topic: Option<String>,
    task: Option<AbortHandle>,
    stats: AckStats,
}

impl ConsumerWrapper {
    pub fn new(client: &BrokerClient, group: impl Into<String>) -> Self {
        let backend = match client {
            BrokerClient::Emulator(emulator) => Backend::Emulator(emulator.clone()),
            #[cfg(feature = "kafka")]
            BrokerClient::Kafka(client) => Backend::Kafka {
                client: client.clone(),
                consumer: None,
            },
        };
        Self {
            id: new_id(),
            group: group.into(),
            backend,
            connected: false,
            topic: None,
            task: None,
            stats: AckStats::default(),
        }
    }

    /// Unique consumer id; used as correlation id for acknowledgements.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> AckStats {
        self.stats
    }

    fn not_ready(&self) -> BusError {
        BusError::NotReady(format!("Consumer {}", self.id))
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        match &mut self.backend {
            Backend::Emulator(emulator) => emulator.ensure_open()?,
            #[cfg(feature = "kafka")]
            Backend::Kafka { client, consumer } => {
                *consumer = Some(Arc::new(client.create_consumer(&self.group)?));
            }
        }
        self.connected = true;
        info!(consumer_id = %self.id, group = %self.group, "Consumer started");
        Ok(())
    }

    /// Topic of the active subscription.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Start receiving messages from `topic`.
    ///
    /// A wrapper holds a single subscription; subscribing again fails with
    /// `BusError::Subscribe` until the wrapper is closed.
    pub async fn subscribe(&mut self, topic: &str) -> Result<Subscription> {
        if !self.connected {
            return Err(self.not_ready());
        }
        if let Some(ref current) = self.topic {
            return Err(BusError::Subscribe(format!(
                "Consumer {} already subscribed to {}",
                self.id, current
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = match &self.backend {
            Backend::Emulator(emulator) => {
                let listener = emulator.subscribe(topic)?;
                tokio::spawn(pump_emulator(topic.to_string(), listener, tx))
            }
            #[cfg(feature = "kafka")]
            Backend::Kafka { consumer, .. } => {
                let consumer = consumer.clone().ok_or_else(|| self.not_ready())?;
                kafka::spawn_consumer_pump(consumer, topic, tx)?
            }
        };

        let task = handle.abort_handle();
        self.task = Some(task.clone());
        self.topic = Some(topic.to_string());
        info!(consumer_id = %self.id, topic = %topic, "Consumer subscribed");

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
            task,
        })
    }

    /// Record the outcome reported for a forwarded message.
    ///
    /// Offsets are committed automatically; nothing is sent to the broker.
    pub fn ack(&mut self, envelope: &Envelope) {
        if envelope.is_error() {
            self.stats.nacks += 1;
            error!(
                consumer_id = %self.id,
                status = envelope.status.unwrap_or_default(),
                body = ?envelope.body,
                "Message processing failed"
            );
        } else {
            self.stats.acks += 1;
            debug!(consumer_id = %self.id, "Message processed");
        }
    }

    /// Record a message the host could not deliver.
    pub fn reject(&mut self, reason: &str) {
        self.stats.rejections += 1;
        warn!(consumer_id = %self.id, reason = %reason, "Message rejected");
    }

    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.topic = None;
        match &mut self.backend {
            Backend::Emulator(_) => {}
            #[cfg(feature = "kafka")]
            Backend::Kafka { consumer, .. } => {
                if let Some(c) = consumer.take() {
                    c.unsubscribe();
                }
            }
        }
        self.connected = false;
        info!(
            consumer_id = %self.id,
            acks = self.stats.acks,
            nacks = self.stats.nacks,
            rejections = self.stats.rejections,
            "Consumer stopped"
        );
    }
}

async fn pump_emulator(
    topic: String,
    mut listener: broadcast::Receiver<bytes::Bytes>,
    tx: mpsc::UnboundedSender<InboundRecord>,
) {
    let mut seq: i64 = 0;
    loop {
        match listener.recv().await {
            Ok(message) => {
                let Some(record) = record_from_message(&topic, &message, seq) else {
                    warn!(topic = %topic, "Dropping undecodable emulator message");
                    continue;
                };
                seq += 1;
                debug!(topic = %topic, offset = record.offset, "Received emulator message");
                if tx.send(record).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "Emulator listener lagged");
                seq += skipped as i64;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Cancellable stream of inbound records for one topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<InboundRecord>,
    task: AbortHandle,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop the pump; records already queued are still yielded.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Stream for Subscription {
    type Item = InboundRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

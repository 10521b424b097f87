//! Producer wrapper: one outbound channel to topic-addressable sinks.

use std::collections::HashMap;

use tracing::info;

use super::{serialize_payload, BrokerClient, BusError, Emulator, Result};
use crate::envelope::{new_id, Body};

#[cfg(feature = "kafka")]
use super::kafka::{self, KafkaClient};
#[cfg(feature = "kafka")]
use rdkafka::producer::FutureProducer;

enum Backend {
    Emulator(Emulator),
    #[cfg(feature = "kafka")]
    Kafka {
        client: KafkaClient,
        producer: Option<FutureProducer>,
    },
}

/// Producer over either broker variant.
///
/// Must be connected before the first send; connect and close are
/// idempotent.
pub struct ProducerWrapper {
    id: String,
    backend: Backend,
    connected: bool,
}

impl ProducerWrapper {
    pub fn new(client: &BrokerClient) -> Self {
        let backend = match client {
            BrokerClient::Emulator(emulator) => Backend::Emulator(emulator.clone()),
            #[cfg(feature = "kafka")]
            BrokerClient::Kafka(client) => Backend::Kafka {
                client: client.clone(),
                producer: None,
            },
        };
        Self {
            id: new_id(),
            backend,
            connected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn not_ready(&self) -> BusError {
        BusError::NotReady(format!("Producer {}", self.id))
    }

    /// Establish the underlying sink.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        match &mut self.backend {
            Backend::Emulator(emulator) => emulator.ensure_open()?,
            #[cfg(feature = "kafka")]
            Backend::Kafka { client, producer } => {
                *producer = Some(client.create_producer().await?);
            }
        }
        self.connected = true;
        info!(producer_id = %self.id, "Producer started");
        Ok(())
    }

    /// Publish `message` to `topic` with a freshly generated key.
    pub async fn send(
        &self,
        topic: &str,
        message: &Body,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        if !self.connected {
            return Err(self.not_ready());
        }

        let payload = serialize_payload(message);
        let key = new_id();

        match &self.backend {
            Backend::Emulator(emulator) => {
                emulator.publish(topic, &key, payload, headers.clone())?;
            }
            #[cfg(feature = "kafka")]
            Backend::Kafka { producer, .. } => {
                let producer = producer.as_ref().ok_or_else(|| self.not_ready())?;
                kafka::send(producer, topic, &key, &payload, headers).await?;
            }
        }
        Ok(())
    }

    /// Disconnect if connected.
    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        match &mut self.backend {
            Backend::Emulator(_) => {}
            #[cfg(feature = "kafka")]
            Backend::Kafka { producer, .. } => {
                if let Some(p) = producer.take() {
                    if let Err(e) = kafka::flush(p, kafka::FLUSH_TIMEOUT).await {
                        tracing::warn!(
                            producer_id = %self.id,
                            error = %e,
                            "Producer closed with undelivered messages"
                        );
                    }
                }
            }
        }
        self.connected = false;
        info!(producer_id = %self.id, "Producer stopped");
    }
}

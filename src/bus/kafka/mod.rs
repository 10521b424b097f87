//! Kafka broker variant.
//!
//! Producers publish with a fresh message key per send; consumers join the
//! configured consumer group and rely on auto-commit for offsets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BusError, InboundRecord, Result};
use crate::config::{ConfigError, SecurityConfig, Settings, TopicSpec};
use crate::utils::retry::connection_backoff;

/// Delivery timeout for a single send.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for a metadata round trip.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `close` waits for queued messages to be delivered.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka connection parameters shared by every producer/consumer of a worker.
#[derive(Clone, Debug)]
pub struct KafkaClient {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Client id presented to the broker.
    pub client_id: String,
    /// SASL / TLS settings.
    pub security: SecurityConfig,
}

impl KafkaClient {
    /// Create a client for the given bootstrap servers.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: format!("kafka-bridge-{}", crate::envelope::new_id()),
            security: SecurityConfig::default(),
        }
    }

    /// Build from worker settings; the broker list must be non-empty.
    pub fn from_settings(settings: &Settings) -> std::result::Result<Self, ConfigError> {
        let brokers = settings.require_brokers()?;
        let mut client = Self::new(brokers.join(","));
        if let Some(ref id) = settings.client_id {
            client.client_id = id.clone();
        }
        client.security = settings.security.clone();
        Ok(client)
    }

    /// Build a ClientConfig for producers.
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers in `group_id`.
    pub fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "true");
        config.set("auto.offset.reset", "earliest");

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        let security = &self.security;

        if let Some(ref protocol) = security.protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = security.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = security.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = security.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = security.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }

    /// Create a producer and verify the cluster is reachable.
    pub async fn create_producer(&self) -> Result<FutureProducer> {
        let producer: FutureProducer = self
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        let probe = || {
            let producer = producer.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    producer
                        .client()
                        .fetch_metadata(None, METADATA_TIMEOUT)
                        .map(|_| ())
                })
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?
                .map_err(|e| BusError::Connection(format!("Kafka unreachable: {}", e)))
            }
        };

        probe
            .retry(connection_backoff())
            .notify(|e: &BusError, delay: Duration| {
                warn!(
                    bootstrap_servers = %self.bootstrap_servers,
                    error = %e,
                    ?delay,
                    "Kafka not reachable, retrying"
                );
            })
            .await?;

        info!(bootstrap_servers = %self.bootstrap_servers, "Connected to Kafka");
        Ok(producer)
    }

    /// Create a consumer in `group_id`.
    pub fn create_consumer(&self, group_id: &str) -> Result<StreamConsumer> {
        self.build_consumer_config(group_id)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))
    }

    /// Create missing topics; existing topics are left untouched.
    pub async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }

        let admin: AdminClient<DefaultClientContext> = self
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka admin: {}", e)))?;

        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|t| {
                NewTopic::new(&t.name, t.partitions, TopicReplication::Fixed(t.replication))
            })
            .collect();

        let results = admin
            .create_topics(new_topics.iter(), &AdminOptions::new())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create topics: {}", e)))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BusError::Connection(format!(
                        "Failed to create topic {}: {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Publish one message.
pub async fn send(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
    headers: &HashMap<String, String>,
) -> Result<()> {
    let mut kafka_headers = OwnedHeaders::new();
    for (k, v) in headers {
        kafka_headers = kafka_headers.insert(Header {
            key: k.as_str(),
            value: Some(v.as_str()),
        });
    }

    let record = FutureRecord::to(topic)
        .key(key)
        .payload(payload)
        .headers(kafka_headers);

    let (partition, offset) = producer
        .send(record, SEND_TIMEOUT)
        .await
        .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

    debug!(topic = %topic, partition, offset, "Published to Kafka");
    Ok(())
}

/// Deliver queued messages; fails if any are still pending after `timeout`.
pub async fn flush(producer: FutureProducer, timeout: Duration) -> Result<()> {
    tokio::task::spawn_blocking(move || producer.flush(timeout))
        .await
        .map_err(|e| BusError::Publish(format!("Flush task failed: {}", e)))?
        .map_err(|e| BusError::Publish(format!("Failed to flush: {}", e)))
}

/// Subscribe `consumer` to `topic` and pump its messages into `tx`.
pub fn spawn_consumer_pump(
    consumer: Arc<StreamConsumer>,
    topic: &str,
    tx: mpsc::UnboundedSender<InboundRecord>,
) -> Result<JoinHandle<()>> {
    consumer
        .subscribe(&[topic])
        .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to {}: {}", topic, e)))?;

    Ok(tokio::spawn(async move {
        let mut stream = consumer.stream();

        while let Some(result) = stream.next().await {
            match result {
                Ok(message) => {
                    let record = record_from_message(&message);
                    debug!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Received Kafka message"
                    );
                    if tx.send(record).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                }
            }
        }
    }))
}

fn record_from_message(message: &BorrowedMessage<'_>) -> InboundRecord {
    let mut headers = HashMap::new();
    if let Some(h) = message.headers() {
        for header in h.iter() {
            if let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) {
                headers.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
        offset: message.offset(),
    }
}

#[cfg(test)]
mod tests;

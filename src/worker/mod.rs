//! Worker runtime: the broker client side of the bridge.
//!
//! Runs inside its own thread with a private single-threaded runtime. It owns
//! the broker client, at most one producer and every consumer, and talks to
//! the host only through encoded [`Envelope`]s:
//!
//! - `init` loads [`Settings`] from the resource path in the header
//! - `start` (once) selects the broker variant, builds consumers and producer
//! - `stop` echoes the stop envelope, closes everything and ends the channel
//! - acknowledgements are matched to a consumer by correlation id
//! - outbound-intent envelopes are published and confirmed
//! - everything else is passed back to the host unchanged

use std::collections::HashMap;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use crate::bus::{
    BrokerClient, BusError, ConsumerWrapper, InboundRecord, ProducerWrapper, Subscription,
};
use crate::config::{ConfigError, ConsumerSpec, Settings};
use crate::envelope::{
    new_id, Body, Envelope, CLIENT_HEADER, META_CLIENT, META_OFFSET, META_PARTITION,
    META_TARGET, META_TOPIC, RESOURCE_PATH_HEADER, TOPIC_HEADER, TRACE_ID_HEADER,
};

/// `type` header of the initialization control message.
pub const INIT_TYPE: &str = "init";
/// `type` header of the start control message.
pub const START_TYPE: &str = "start";
/// `type` header of the stop control message.
pub const STOP_TYPE: &str = "stop";
/// `type` header of an exception envelope sent back by the host.
pub const EXCEPTION_TYPE: &str = "exception";
/// Confirmation message of a successful publish.
pub const EVENT_SENT: &str = "Event sent";

/// Errors that abort the `start` transition.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

/// A consumer created from one adapter configuration entry.
pub struct ConsumerRegistration {
    pub wrapper: ConsumerWrapper,
    pub topic: String,
    pub target: String,
    pub tracing: bool,
}

/// Actor state of one worker.
pub struct WorkerRuntime {
    state: WorkerState,
    settings: Option<Settings>,
    client: Option<BrokerClient>,
    producer: Option<ProducerWrapper>,
    consumers: HashMap<String, ConsumerRegistration>,
    streams: StreamMap<String, Subscription>,
    outbox: Option<mpsc::UnboundedSender<Bytes>>,
}

impl WorkerRuntime {
    /// Create a worker that reports to the host through `outbox`.
    pub fn new(outbox: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            state: WorkerState::Uninitialized,
            settings: None,
            client: None,
            producer: None,
            consumers: HashMap::new(),
            streams: StreamMap::new(),
            outbox: Some(outbox),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Receive loop: host messages and inbound broker records until stopped.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        debug!("Kafka worker loop entered");

        while self.state != WorkerState::Stopped {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(bytes) => self.on_host_message(&bytes).await,
                    None => {
                        debug!("Host channel closed");
                        self.shutdown().await;
                    }
                },
                Some((consumer_id, record)) = self.streams.next(), if !self.streams.is_empty() => {
                    self.on_record(&consumer_id, record);
                }
            }
        }

        debug!("Kafka worker loop exited");
    }

    async fn on_host_message(&mut self, bytes: &[u8]) {
        match Envelope::from_bytes(bytes) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => error!(error = %e, "Dropping undecodable host message"),
        }
    }

    /// Classify and process one envelope from the host.
    pub async fn handle(&mut self, envelope: Envelope) {
        if let Some(registration) = envelope
            .correlation_id
            .as_deref()
            .and_then(|cid| self.consumers.get_mut(cid))
        {
            registration.wrapper.ack(&envelope);
            return;
        }

        match envelope.message_type() {
            Some(INIT_TYPE) => {
                self.init(&envelope);
                return;
            }
            Some(START_TYPE) => {
                if self.state == WorkerState::Running {
                    debug!("Kafka worker already started");
                } else if let Err(e) = self.start().await {
                    error!(error = %e, "Unable to start Kafka worker");
                    self.shutdown().await;
                }
                return;
            }
            Some(STOP_TYPE) => {
                self.stop(envelope).await;
                return;
            }
            Some(EXCEPTION_TYPE) => {
                if let Some(registration) = envelope
                    .header(CLIENT_HEADER)
                    .and_then(|client| self.consumers.get_mut(client))
                {
                    let reason = envelope
                        .body
                        .as_ref()
                        .and_then(Body::as_str)
                        .unwrap_or("unknown");
                    registration.wrapper.reject(reason);
                    return;
                }
            }
            _ => {}
        }

        let outbound =
            outbound_content(&envelope).map(|(topic, content)| (topic.to_string(), content));
        if let Some((topic, content)) = outbound {
            self.publish(envelope, topic, content).await;
            return;
        }

        self.emit(&envelope);
    }

    fn init(&mut self, envelope: &Envelope) {
        let Some(resource_path) = envelope.header(RESOURCE_PATH_HEADER) else {
            warn!("Ignoring init without {}", RESOURCE_PATH_HEADER);
            return;
        };
        let parameters = runtime_parameters(envelope.body.as_ref());

        match Settings::load(std::path::Path::new(resource_path), &parameters) {
            Ok(settings) => {
                self.settings = Some(settings);
                if self.state == WorkerState::Uninitialized {
                    self.state = WorkerState::Initialized;
                }
                info!(resource_path = %resource_path, "Kafka worker initialized");
            }
            Err(e) => {
                error!(resource_path = %resource_path, error = %e, "Unable to load worker settings");
            }
        }
    }

    async fn start(&mut self) -> Result<(), WorkerError> {
        if self.state != WorkerState::Initialized {
            return Err(ConfigError::NotInitialized.into());
        }
        let settings = self.settings.clone().ok_or(ConfigError::NotInitialized)?;

        let client = BrokerClient::from_settings(&settings)?;
        self.client = Some(client.clone());

        #[cfg(feature = "kafka")]
        {
            if let BrokerClient::Kafka(kafka) = &client {
                kafka.ensure_topics(&settings.topics).await?;
            }
        }

        for spec in settings.consumer_specs() {
            self.setup_consumer(&client, spec).await?;
        }

        if settings.producer.enabled {
            let mut producer = ProducerWrapper::new(&client);
            producer.connect().await?;
            self.producer = Some(producer);
        }

        self.state = WorkerState::Running;
        info!(
            consumers = self.consumers.len(),
            producer = self.producer.is_some(),
            "{}",
            if client.is_emulator() {
                "Kafka emulator started"
            } else {
                "Kafka worker started"
            }
        );
        Ok(())
    }

    async fn setup_consumer(
        &mut self,
        client: &BrokerClient,
        spec: ConsumerSpec,
    ) -> Result<(), WorkerError> {
        let mut wrapper = ConsumerWrapper::new(client, &spec.group);

        let subscription = match wrapper.connect().await {
            Ok(()) => wrapper.subscribe(&spec.topic).await,
            Err(e) => Err(e),
        };
        let subscription = match subscription {
            Ok(s) => s,
            Err(e) => {
                error!(
                    topic = %spec.topic,
                    route = %spec.target,
                    group = %spec.group,
                    error = %e,
                    "Unable to set up consumer"
                );
                wrapper.close().await;
                return Err(e.into());
            }
        };

        let id = wrapper.id().to_string();
        self.streams.insert(id.clone(), subscription);
        self.consumers.insert(
            id,
            ConsumerRegistration {
                wrapper,
                topic: spec.topic,
                target: spec.target,
                tracing: spec.tracing,
            },
        );
        Ok(())
    }

    async fn publish(&mut self, mut envelope: Envelope, topic: String, content: Body) {
        let mut headers = envelope.external_headers();
        if let Some(ref trace_id) = envelope.trace_id {
            headers.insert(TRACE_ID_HEADER.to_string(), trace_id.clone());
        }

        let outcome = match self.producer.as_ref() {
            Some(producer) => producer
                .send(&topic, &content, &headers)
                .await
                .map_err(|e| (500, e.to_string())),
            None => Err((503, "Kafka producer not enabled".to_string())),
        };

        let message = match outcome {
            Ok(()) => {
                debug!(topic = %topic, "Outbound event sent");
                EVENT_SENT.to_string()
            }
            Err((status, reason)) => {
                error!(topic = %topic, status, error = %reason, "Unable to send outbound event");
                envelope.status = Some(status);
                reason
            }
        };

        envelope.body = Some(Body::Value(confirmation(&topic, &message)));
        self.emit(&envelope);
    }

    fn on_record(&mut self, consumer_id: &str, record: InboundRecord) {
        let Some(registration) = self.consumers.get(consumer_id) else {
            warn!(consumer_id = %consumer_id, "Record for unknown consumer");
            return;
        };
        debug!(
            consumer_id = %consumer_id,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Forwarding inbound record"
        );
        let envelope = inbound_envelope(
            &record,
            consumer_id,
            &registration.target,
            registration.tracing,
        );
        self.emit(&envelope);
    }

    /// Echo the stop envelope, then release every resource.
    async fn stop(&mut self, envelope: Envelope) {
        if matches!(self.state, WorkerState::Stopping | WorkerState::Stopped) {
            debug!("Kafka worker already stopped");
            return;
        }
        self.emit(&envelope);
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        self.state = WorkerState::Stopping;

        self.streams = StreamMap::new();
        for registration in self.consumers.values_mut() {
            registration.wrapper.close().await;
        }
        if let Some(producer) = self.producer.as_mut() {
            producer.close().await;
        }

        let emulator = match self.client.take() {
            Some(client) => {
                client.shutdown();
                client.is_emulator()
            }
            None => true,
        };

        self.outbox = None;
        self.state = WorkerState::Stopped;
        info!(
            "{}",
            if emulator {
                "Kafka emulator stopped"
            } else {
                "Kafka worker stopped"
            }
        );
    }

    fn emit(&self, envelope: &Envelope) {
        match self.outbox {
            Some(ref outbox) => {
                if outbox.send(envelope.sanitized_copy().to_bytes()).is_err() {
                    debug!(id = %envelope.id, "Host channel closed, dropping envelope");
                }
            }
            None => debug!(id = %envelope.id, "Worker stopped, dropping envelope"),
        }
    }
}

/// Topic and content of an outbound-intent envelope.
///
/// The `topic` header must be set and the body must be either a mapping
/// with a `content` field or raw bytes.
pub fn outbound_content(envelope: &Envelope) -> Option<(&str, Body)> {
    let topic = envelope.header(TOPIC_HEADER).filter(|t| !t.is_empty())?;
    match envelope.body.as_ref()? {
        Body::Bytes(raw) => Some((topic, Body::Bytes(raw.clone()))),
        body => body
            .field("content")
            .map(|content| (topic, Body::Value(content.clone()))),
    }
}

/// Body of the publish confirmation.
pub fn confirmation(topic: &str, message: &str) -> Value {
    json!({
        "topic": topic,
        "message": message,
        "time": Utc::now().to_rfc3339(),
    })
}

/// Build the host-bound envelope for an inbound broker record.
///
/// String broker headers are copied; the trace header is matched
/// case-insensitively and stored lower-case. Reserved metadata is stamped
/// last so broker headers cannot override it.
pub fn inbound_envelope(
    record: &InboundRecord,
    consumer_id: &str,
    target: &str,
    tracing: bool,
) -> Envelope {
    let mut envelope = Envelope::new();
    envelope.body = record.body();

    let mut has_trace = false;
    for (key, value) in &record.headers {
        if key.eq_ignore_ascii_case(TRACE_ID_HEADER) {
            has_trace = true;
            envelope
                .headers
                .insert(TRACE_ID_HEADER.to_string(), value.clone());
        } else {
            envelope.headers.insert(key.clone(), value.clone());
        }
    }
    if tracing && !has_trace {
        envelope
            .headers
            .insert(TRACE_ID_HEADER.to_string(), new_id());
    }

    envelope
        .with_header(META_CLIENT, consumer_id)
        .with_header(META_TARGET, target)
        .with_header(META_TOPIC, record.topic.as_str())
        .with_header(META_PARTITION, record.partition.to_string())
        .with_header(META_OFFSET, record.offset.to_string())
}

fn runtime_parameters(body: Option<&Body>) -> Vec<String> {
    match body.and_then(Body::as_value) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests;

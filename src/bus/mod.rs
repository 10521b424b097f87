//! Broker access for the worker.
//!
//! This module contains:
//! - `BrokerClient`: the closed set of broker variants (real Kafka, emulator)
//! - `ProducerWrapper` / `ConsumerWrapper`: one capability interface over both
//! - `InboundRecord` and payload interpretation
//! - Implementations: Kafka (feature `kafka`), in-process emulator

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ConfigError, Settings};
use crate::envelope::Body;

pub mod consumer;
pub mod emulator;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod producer;

pub use consumer::{AckStats, ConsumerWrapper, Subscription};
pub use emulator::Emulator;
#[cfg(feature = "kafka")]
pub use kafka::KafkaClient;
pub use producer::ProducerWrapper;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{0} not ready")]
    NotReady(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Payload is neither JSON nor UTF-8 text: {0}")]
    PayloadDecode(String),
}

/// Broker client selected once at worker start-up.
#[derive(Clone)]
pub enum BrokerClient {
    /// In-process topic emulator.
    Emulator(Emulator),
    /// Real Kafka cluster.
    #[cfg(feature = "kafka")]
    Kafka(KafkaClient),
}

impl BrokerClient {
    /// Select the variant from settings.
    ///
    /// Outside emulator mode the broker addresses must be present.
    pub fn from_settings(settings: &Settings) -> std::result::Result<Self, ConfigError> {
        if settings.emulate.kafka {
            info!("Using Kafka emulator");
            return Ok(BrokerClient::Emulator(Emulator::new()));
        }

        let _brokers = settings.require_brokers()?;

        #[cfg(feature = "kafka")]
        {
            Ok(BrokerClient::Kafka(KafkaClient::from_settings(settings)?))
        }

        #[cfg(not(feature = "kafka"))]
        {
            Err(ConfigError::KafkaUnavailable)
        }
    }

    pub fn is_emulator(&self) -> bool {
        matches!(self, BrokerClient::Emulator(_))
    }

    /// Release client-wide resources.
    pub fn shutdown(&self) {
        match self {
            BrokerClient::Emulator(emulator) => emulator.shutdown(),
            #[cfg(feature = "kafka")]
            BrokerClient::Kafka(_) => {}
        }
    }
}

/// A message received from a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    pub topic: String,
    /// Always 0 for the emulator.
    pub partition: i32,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    /// String-valued broker headers; non-UTF-8 header values are skipped.
    pub headers: HashMap<String, String>,
    pub offset: i64,
}

impl InboundRecord {
    /// Body interpretation of the raw value; `None` for tombstones.
    pub fn body(&self) -> Option<Body> {
        self.value.as_deref().map(interpret_payload)
    }
}

/// Strictly interpret a payload as JSON, then as UTF-8 text.
pub fn parse_payload(raw: &[u8]) -> Result<Body> {
    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        return Ok(Body::Value(value));
    }
    std::str::from_utf8(raw)
        .map(Body::text)
        .map_err(|e| BusError::PayloadDecode(e.to_string()))
}

/// Interpret a payload: JSON structure, else UTF-8 text, else raw bytes.
pub fn interpret_payload(raw: &[u8]) -> Body {
    parse_payload(raw).unwrap_or_else(|e| {
        debug!(len = raw.len(), error = %e, "Keeping binary payload");
        Body::Bytes(raw.to_vec())
    })
}

/// Serialize outbound content for the broker.
///
/// Raw bytes pass through, text is UTF-8 encoded, anything else is JSON.
pub fn serialize_payload(body: &Body) -> Vec<u8> {
    match body {
        Body::Bytes(raw) => raw.clone(),
        Body::Value(Value::String(text)) => text.clone().into_bytes(),
        Body::Value(value) => value.to_string().into_bytes(),
    }
}

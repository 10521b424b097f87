//! Adapter front.

use async_trait::async_trait;
use tracing::error;

use crate::bridge::KafkaBridge;
use crate::envelope::Envelope;
use crate::routing::{AppError, RouteHandler};
use crate::worker::START_TYPE;

/// Pass-through interceptor in front of the bridge.
///
/// A `start` signal creates the worker; every envelope, `start` included,
/// is then forwarded unchanged. Responses come back through the bridge, so
/// the handler itself never returns one.
pub struct BrokerAdapter {
    bridge: KafkaBridge,
}

impl BrokerAdapter {
    pub fn new(bridge: KafkaBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl RouteHandler for BrokerAdapter {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, AppError> {
        if envelope.message_type() == Some(START_TYPE) {
            if let Err(e) = self.bridge.ensure_started() {
                error!(error = %e, "Kafka adapter not started");
                return Err(AppError::new(503, e.to_string()));
            }
        }
        self.bridge.send_to_worker(&envelope);
        Ok(None)
    }
}

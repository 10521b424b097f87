//! Default listener for inbound broker events.

use async_trait::async_trait;
use tracing::info;

use crate::envelope::{Envelope, META_OFFSET, META_PARTITION, META_TOPIC};
use crate::routing::{AppError, RouteHandler};

/// Logs each event and acknowledges it with an empty response.
#[derive(Default)]
pub struct EventLogger;

#[async_trait]
impl RouteHandler for EventLogger {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, AppError> {
        info!(
            route = envelope.to.as_deref().unwrap_or_default(),
            topic = envelope.header(META_TOPIC).unwrap_or_default(),
            partition = envelope.header(META_PARTITION).unwrap_or_default(),
            offset = envelope.header(META_OFFSET).unwrap_or_default(),
            body = ?envelope.body,
            "Received event"
        );
        Ok(Some(Envelope::new()))
    }
}

//! Publish to a topic on behalf of a caller and return the confirmation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{Envelope, TOPIC_HEADER, TRACE_ID_HEADER};
use crate::routing::{AppError, EventRouter, RouteHandler};

/// How long to wait for the worker's confirmation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const INVALID_INPUT: &str = "Input must contain topic in headers and content in body";

pub struct KafkaNotification {
    router: Arc<dyn EventRouter>,
    adapter_route: String,
    timeout: Duration,
}

impl KafkaNotification {
    pub fn new(router: Arc<dyn EventRouter>, adapter_route: impl Into<String>) -> Self {
        Self {
            router,
            adapter_route: adapter_route.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RouteHandler for KafkaNotification {
    async fn handle(&self, mut envelope: Envelope) -> Result<Option<Envelope>, AppError> {
        let has_topic = envelope.header(TOPIC_HEADER).is_some_and(|t| !t.is_empty());
        let has_content = envelope
            .body
            .as_ref()
            .is_some_and(|b| b.field("content").is_some());
        if !has_topic || !has_content {
            return Err(AppError::new(400, INVALID_INPUT));
        }

        if let Some(trace_id) = envelope.trace_id.clone() {
            envelope.headers.insert(TRACE_ID_HEADER.to_string(), trace_id);
        }
        envelope.to = Some(self.adapter_route.clone());

        let response = self
            .router
            .request(envelope, self.timeout)
            .await
            .map_err(AppError::from)?;

        if let Some(status) = response.status.filter(|s| *s >= 400) {
            let message = match response.body.as_ref() {
                Some(body) => body
                    .field("message")
                    .and_then(|m| m.as_str())
                    .or_else(|| body.as_str())
                    .unwrap_or("Unable to send event")
                    .to_string(),
                None => "Unable to send event".to_string(),
            };
            return Err(AppError::new(status, message));
        }
        let mut confirmation = Envelope::new();
        confirmation.body = response.body;
        Ok(Some(confirmation))
    }
}

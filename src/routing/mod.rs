//! Host-side routing.
//!
//! This module contains:
//! - `EventRouter`: the event-routing runtime the bridge dispatches through
//! - `WorkflowEngine`: launches multi-step flows addressed with `flow://`
//! - `RouteHandler`: a function registered under a route name
//! - `RoutingResolver`: decides where an inbound broker message goes
//! - `LocalRouter`: in-process `EventRouter` implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::envelope::{
    Body, Envelope, CLIENT_HEADER, META_CLIENT, META_OFFSET, META_PARTITION, META_TARGET,
    META_TOPIC, TRACE_ID_HEADER, TYPE_HEADER,
};

mod local;

pub use local::LocalRouter;

/// Destination prefix of a workflow reference.
pub const FLOW_PREFIX: &str = "flow://";

/// Errors raised by the routing runtime.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route {0} not found")]
    NotFound(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Request to {0} timed out")]
    Timeout(String),
}

/// Application error with an HTTP-style status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("({status}) {message}")]
pub struct AppError {
    pub status: i32,
    pub message: String,
}

impl AppError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Error response envelope carrying this status.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new()
            .with_status(self.status)
            .with_body(self.message.as_str())
    }
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        let status = match e {
            RouteError::NotFound(_) => 404,
            RouteError::Timeout(_) => 408,
            RouteError::Dispatch(_) => 500,
        };
        AppError::new(status, e.to_string())
    }
}

/// A function registered under a route name.
///
/// A returned envelope is delivered to the request's reply-to route.
/// Interceptors return `None` and reply on their own.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, AppError>;
}

/// Event-routing runtime.
#[async_trait]
pub trait EventRouter: Send + Sync {
    /// True if `route` has a registered handler.
    fn exists(&self, route: &str) -> bool;

    /// Deliver `envelope` to its destination without waiting.
    async fn send(&self, envelope: Envelope) -> Result<(), RouteError>;

    /// Deliver `envelope` and wait for the response.
    async fn request(&self, envelope: Envelope, timeout: Duration)
        -> Result<Envelope, RouteError>;
}

/// Broker position of an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMetadata {
    pub topic: Option<String>,
    pub partition: Option<String>,
    pub offset: Option<String>,
}

/// Input dataset of a workflow launched from a broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDataset {
    pub body: Option<Body>,
    /// Broker headers; adapter metadata excluded.
    pub header: HashMap<String, String>,
    pub metadata: FlowMetadata,
}

/// A workflow invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowLaunch {
    pub flow_id: String,
    pub dataset: FlowDataset,
    pub correlation_id: String,
    pub reply_to: String,
    pub trace_id: Option<String>,
    pub trace_path: Option<String>,
}

/// Workflow engine.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn launch(&self, launch: FlowLaunch) -> Result<(), RouteError>;
}

/// Outcome of resolving one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Handed to the workflow engine.
    Workflow { flow_id: String },
    /// Forwarded to a registered route.
    Route { target: String },
    /// Target unknown; `exception` must be returned to the worker.
    RouteNotFound { exception: Envelope },
    /// No consumer/target metadata; nothing to do.
    Unaddressed,
    /// Dispatch failed; already logged.
    Failed(String),
}

/// Decides whether an inbound broker message goes to a workflow or a route.
pub struct RoutingResolver {
    router: Arc<dyn EventRouter>,
    workflows: Option<Arc<dyn WorkflowEngine>>,
    address: String,
}

impl RoutingResolver {
    /// `address` is the bridge's own route, used as sender and reply-to.
    pub fn new(
        router: Arc<dyn EventRouter>,
        workflows: Option<Arc<dyn WorkflowEngine>>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            router,
            workflows,
            address: address.into(),
        }
    }

    pub async fn resolve(&self, envelope: Envelope) -> Resolution {
        let (Some(client), Some(target)) = (
            envelope.header(META_CLIENT).map(str::to_string),
            envelope.header(META_TARGET).map(str::to_string),
        ) else {
            debug!(id = %envelope.id, "Ignoring worker message without consumer metadata");
            return Resolution::Unaddressed;
        };

        let topic = envelope.header(META_TOPIC).map(str::to_string);
        let trace_id = envelope.header(TRACE_ID_HEADER).map(str::to_string);
        let trace_path = trace_id
            .as_ref()
            .map(|_| format!("TOPIC {}", topic.as_deref().unwrap_or_default()));

        if let Some(flow_id) = target.strip_prefix(FLOW_PREFIX) {
            return self
                .launch_flow(flow_id, client, topic, trace_id, trace_path, envelope)
                .await;
        }

        if self.router.exists(&target) {
            let mut request = Envelope::new()
                .with_to(target.as_str())
                .with_from(self.address.as_str())
                .with_correlation_id(client)
                .with_reply_to(self.address.as_str())
                .with_headers(envelope.headers);
            request.body = envelope.body;
            request.trace_id = trace_id;
            request.trace_path = trace_path;

            return match self.router.send(request).await {
                Ok(()) => Resolution::Route { target },
                Err(e) => {
                    error!(route = %target, error = %e, "Unable to relay incoming Kafka event");
                    Resolution::Failed(e.to_string())
                }
            };
        }

        error!(route = %target, "Unable to relay incoming Kafka event - route {} not found", target);
        let exception = Envelope::new()
            .with_header(CLIENT_HEADER, client)
            .with_header(TYPE_HEADER, "exception")
            .with_body(format!("route {} not found", target));
        Resolution::RouteNotFound { exception }
    }

    async fn launch_flow(
        &self,
        flow_id: &str,
        client: String,
        topic: Option<String>,
        trace_id: Option<String>,
        trace_path: Option<String>,
        envelope: Envelope,
    ) -> Resolution {
        let Some(ref workflows) = self.workflows else {
            error!(flow_id = %flow_id, "No workflow engine for incoming Kafka event");
            return Resolution::Failed(format!("no workflow engine for {}", flow_id));
        };

        let dataset = FlowDataset {
            header: envelope.external_headers(),
            metadata: FlowMetadata {
                topic,
                partition: envelope.header(META_PARTITION).map(str::to_string),
                offset: envelope.header(META_OFFSET).map(str::to_string),
            },
            body: envelope.body,
        };
        let launch = FlowLaunch {
            flow_id: flow_id.to_string(),
            dataset,
            correlation_id: client,
            reply_to: self.address.clone(),
            trace_id,
            trace_path,
        };

        match workflows.launch(launch).await {
            Ok(()) => {
                debug!(flow_id = %flow_id, "Launched flow");
                Resolution::Workflow {
                    flow_id: flow_id.to_string(),
                }
            }
            Err(e) => {
                error!(flow_id = %flow_id, error = %e, "Unable to launch flow");
                Resolution::Failed(e.to_string())
            }
        }
    }
}

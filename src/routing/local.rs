//! In-process routing runtime.
//!
//! Every delivery runs as its own task. A handler's response, or its
//! [`AppError`], is delivered to the request's reply-to route with the
//! request's correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{AppError, EventRouter, RouteError, RouteHandler};
use crate::envelope::{new_id, Envelope, EXEC_TIME_ANNOTATION};

/// Route registry with fire-and-forget and request/reply delivery.
#[derive(Clone, Default)]
pub struct LocalRouter {
    routes: Arc<RwLock<HashMap<String, Arc<dyn RouteHandler>>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, route: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        let route = route.into();
        debug!(route = %route, "Registered route");
        self.routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(route, handler);
    }

    pub fn unregister(&self, route: &str) {
        self.routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(route);
    }

    fn handler(&self, route: &str) -> Option<Arc<dyn RouteHandler>> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(route)
            .cloned()
    }

    fn dispatch(&self, handler: Arc<dyn RouteHandler>, envelope: Envelope) {
        let router = self.clone();
        tokio::spawn(async move {
            let reply_to = envelope.reply_to.clone();
            let correlation_id = envelope.correlation_id.clone();
            let to = envelope.to.clone().unwrap_or_default();

            let started = Instant::now();
            let mut response = match handler.handle(envelope).await {
                Ok(Some(response)) => response,
                Ok(None) => return,
                Err(e) => {
                    warn!(route = %to, status = e.status, error = %e.message, "Route handler failed");
                    e.to_envelope()
                }
            };
            response.annotations.insert(
                EXEC_TIME_ANNOTATION.to_string(),
                format!("{:.3}", started.elapsed().as_secs_f64() * 1000.0),
            );

            let Some(reply_to) = reply_to else {
                debug!(route = %to, "Dropping response without reply-to");
                return;
            };
            let mut response = response.with_to(reply_to).with_from(to);
            response.correlation_id = correlation_id;
            if let Err(e) = router.send(response).await {
                warn!(error = %e, "Unable to deliver response");
            }
        });
    }
}

#[async_trait]
impl EventRouter for LocalRouter {
    fn exists(&self, route: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(route)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), RouteError> {
        let Some(to) = envelope.to.clone() else {
            return Err(RouteError::Dispatch("missing destination".to_string()));
        };
        let handler = self.handler(&to).ok_or(RouteError::NotFound(to))?;
        self.dispatch(handler, envelope);
        Ok(())
    }

    async fn request(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RouteError> {
        let to = envelope.to.clone().unwrap_or_default();
        let inbox = format!("r.{}", new_id());
        let (tx, rx) = oneshot::channel();
        self.register(inbox.as_str(), Arc::new(ReplyInbox::new(tx)));

        // Each exchange gets its own correlation id; the caller's id may
        // belong to an earlier exchange and is restored on the response.
        envelope.reply_to = Some(inbox.clone());
        let caller_cid = envelope.correlation_id.replace(new_id());

        let result = match self.send(envelope).await {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(mut response)) => {
                    response.correlation_id = caller_cid;
                    Ok(response)
                }
                Ok(Err(_)) => Err(RouteError::Dispatch(format!("reply inbox for {} closed", to))),
                Err(_) => Err(RouteError::Timeout(to)),
            },
            Err(e) => Err(e),
        };

        self.unregister(&inbox);
        result
    }
}

/// Temporary route receiving exactly one response.
struct ReplyInbox {
    tx: Mutex<Option<oneshot::Sender<Envelope>>>,
}

impl ReplyInbox {
    fn new(tx: oneshot::Sender<Envelope>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl RouteHandler for ReplyInbox {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, AppError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(envelope);
        }
        Ok(None)
    }
}

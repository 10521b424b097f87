//! Host side of the broker bridge.
//!
//! [`KafkaBridge`] owns the worker thread. It is created lazily on the first
//! `start` signal, receives the `init` control message immediately, and from
//! then on exchanges encoded envelopes with the worker:
//!
//! - host → worker: sanitized copies via [`KafkaBridge::send_to_worker`]
//! - worker → host: [`KafkaBridge::on_message`], either a reply to a waiting
//!   caller or an inbound broker message for the [`RoutingResolver`]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::config::BridgeConfig;
use crate::envelope::{Envelope, RESOURCE_PATH_HEADER, TYPE_HEADER};
use crate::routing::{EventRouter, Resolution, RoutingResolver, WorkflowEngine};
use crate::worker::{WorkerRuntime, INIT_TYPE};

/// Name of the worker thread.
const WORKER_THREAD_NAME: &str = "kafka-worker";

/// Errors raised while creating the worker.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Manages the isolated worker and relays envelopes across its boundary.
#[derive(Clone)]
pub struct KafkaBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    router: Arc<dyn EventRouter>,
    resolver: RoutingResolver,
    started: AtomicBool,
    worker: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    running: watch::Sender<bool>,
}

impl KafkaBridge {
    pub fn new(
        config: BridgeConfig,
        router: Arc<dyn EventRouter>,
        workflows: Option<Arc<dyn WorkflowEngine>>,
    ) -> Self {
        let resolver = RoutingResolver::new(router.clone(), workflows, config.route.as_str());
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(BridgeInner {
                config,
                router,
                resolver,
                started: AtomicBool::new(false),
                worker: Mutex::new(None),
                running,
            }),
        }
    }

    /// Route name of the adapter front.
    pub fn route(&self) -> &str {
        &self.inner.config.route
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Create the worker once and send it `init`.
    ///
    /// Must be called from within a tokio runtime; the relay task runs there.
    pub fn ensure_started(&self) -> Result<(), BridgeError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.spawn_worker() {
            error!(error = %e, "Unable to create Kafka worker");
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let init = Envelope::new()
            .with_header(TYPE_HEADER, INIT_TYPE)
            .with_header(
                RESOURCE_PATH_HEADER,
                self.inner.config.resource_path.to_string_lossy(),
            )
            .with_body(Value::from(self.inner.config.parameters.clone()));
        self.send_to_worker(&init);
        Ok(())
    }

    fn spawn_worker(&self) -> Result<(), BridgeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;

        let (to_worker, inbox) = mpsc::unbounded_channel::<Bytes>();
        let (outbox, mut from_worker) = mpsc::unbounded_channel::<Bytes>();
        let worker = WorkerRuntime::new(outbox);

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(worker.run(inbox)))
            .map_err(BridgeError::Spawn)?;

        *self.worker_slot() = Some(to_worker);
        self.inner.running.send_replace(true);
        info!("Kafka worker created");

        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = from_worker.recv().await {
                bridge.on_message(&bytes).await;
            }

            *bridge.worker_slot() = None;
            if tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_or(true, |joined| joined.is_err())
            {
                error!("Kafka worker thread panicked");
            }
            bridge.inner.running.send_replace(false);
            info!("Kafka worker finished");
        });
        Ok(())
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forward a sanitized copy into the worker; no-op unless it is running.
    pub fn send_to_worker(&self, envelope: &Envelope) {
        match self.worker_slot().as_ref() {
            Some(worker) => {
                if worker.send(envelope.sanitized_copy().to_bytes()).is_err() {
                    debug!(id = %envelope.id, "Kafka worker has stopped");
                }
            }
            None => debug!(id = %envelope.id, "Kafka worker not running"),
        }
    }

    /// Handle an encoded envelope emitted by the worker.
    pub async fn on_message(&self, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Dropping undecodable worker message");
                return;
            }
        };

        if let (Some(_), Some(reply_to)) = (&envelope.to, &envelope.reply_to) {
            let mut response = Envelope::new().with_to(reply_to.as_str());
            response.correlation_id = envelope.correlation_id.clone();
            response.status = envelope.status;
            response.body = envelope.body;
            if let Err(e) = self.inner.router.send(response).await {
                error!(error = %e, "Unable to deliver worker response");
            }
            return;
        }

        if let Resolution::RouteNotFound { exception } =
            self.inner.resolver.resolve(envelope.sanitized_copy()).await
        {
            self.send_to_worker(&exception);
        }
    }

    /// Wait until the worker has finished; returns at once if never started.
    pub async fn wait_stopped(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }
}

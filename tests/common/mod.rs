//! Shared utilities for integration tests.
//!
//! Builds an in-process host: a `LocalRouter` with the adapter and
//! notification routes, a `KafkaBridge` in emulator mode, and capturing
//! listeners for consumer targets.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kafka_bridge::bridge::KafkaBridge;
use kafka_bridge::config::{BridgeConfig, ADAPTER_FILE, APPLICATION_FILE, DEFAULT_NOTIFICATION_ROUTE};
use kafka_bridge::envelope::{Envelope, TOPIC_HEADER, TYPE_HEADER};
use kafka_bridge::handlers::{BrokerAdapter, KafkaNotification};
use kafka_bridge::routing::{
    AppError, EventRouter, FlowLaunch, LocalRouter, RouteError, RouteHandler, WorkflowEngine,
};
use kafka_bridge::worker::{START_TYPE, STOP_TYPE};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Default wait for asynchronous deliveries.
pub const WAIT: Duration = Duration::from_secs(5);

/// Resource directory for emulator mode with the given adapter config.
pub fn emulator_resources(adapter_yaml: &str) -> TempDir {
    resources(adapter_yaml, "emulate:\n  kafka: true\n")
}

pub fn resources(adapter_yaml: &str, application_yaml: &str) -> TempDir {
    let dir = TempDir::new().expect("Failed to create resource dir");
    std::fs::write(dir.path().join(ADAPTER_FILE), adapter_yaml).unwrap();
    std::fs::write(dir.path().join(APPLICATION_FILE), application_yaml).unwrap();
    dir
}

/// Route handler forwarding every envelope to a channel.
pub struct Capture {
    tx: mpsc::UnboundedSender<Envelope>,
    ack: bool,
}

#[async_trait]
impl RouteHandler for Capture {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, AppError> {
        let _ = self.tx.send(envelope);
        Ok(self.ack.then(Envelope::new))
    }
}

/// Workflow engine recording every launch.
#[derive(Default)]
pub struct RecordingEngine {
    pub launches: Mutex<Vec<FlowLaunch>>,
}

#[async_trait]
impl WorkflowEngine for RecordingEngine {
    async fn launch(&self, launch: FlowLaunch) -> Result<(), RouteError> {
        self.launches.lock().unwrap().push(launch);
        Ok(())
    }
}

/// In-process host around one bridge.
pub struct Host {
    pub router: LocalRouter,
    pub bridge: KafkaBridge,
    pub notification: KafkaNotification,
    _resources: TempDir,
}

impl Host {
    pub fn new(resources: TempDir, workflows: Option<Arc<dyn WorkflowEngine>>) -> Self {
        let router = LocalRouter::new();
        let shared: Arc<dyn EventRouter> = Arc::new(router.clone());
        let config = BridgeConfig::default().with_resource_path(resources.path());
        let bridge = KafkaBridge::new(config, shared.clone(), workflows);

        router.register(bridge.route(), Arc::new(BrokerAdapter::new(bridge.clone())));
        router.register(
            DEFAULT_NOTIFICATION_ROUTE,
            Arc::new(KafkaNotification::new(shared.clone(), bridge.route())),
        );
        let notification = KafkaNotification::new(shared, bridge.route()).with_timeout(WAIT);

        Self {
            router,
            bridge,
            notification,
            _resources: resources,
        }
    }

    /// Register a capturing listener; `ack` answers each event.
    pub fn listen(&self, route: &str, ack: bool) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.register(route, Arc::new(Capture { tx, ack }));
        rx
    }

    async fn control(&self, kind: &str) {
        let envelope = Envelope::new()
            .with_to(self.bridge.route())
            .with_header(TYPE_HEADER, kind);
        self.router.send(envelope).await.expect("adapter route missing");
    }

    /// Send `start` and wait until the worker thread exists.
    pub async fn start(&self) {
        self.control(START_TYPE).await;
        tokio::time::timeout(WAIT, async {
            while !self.bridge.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker did not start");
    }

    pub async fn stop(&self) {
        self.control(STOP_TYPE).await;
    }

    pub async fn wait_stopped(&self) {
        tokio::time::timeout(WAIT, self.bridge.wait_stopped())
            .await
            .expect("worker did not stop");
    }

    /// Publish through the notification route's handler.
    pub async fn publish(&self, topic: &str, content: Value) -> Result<Option<Envelope>, AppError> {
        let request = Envelope::new()
            .with_header(TOPIC_HEADER, topic)
            .with_body(serde_json::json!({ "content": content }));
        self.notification.handle(request).await
    }
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

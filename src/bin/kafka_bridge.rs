//! kafka-bridge: standalone broker bridge host
//!
//! Runs the adapter, the notification publisher and a logging listener on
//! an in-process router, starts the worker and stops it on Ctrl-C.
//!
//! ## Architecture
//! ```text
//! kafka-bridge (host runtime)
//!     │
//!     ├── LocalRouter
//!     │     ├── kafka.adapter       → KafkaBridge ──envelopes──→ kafka-worker thread
//!     │     ├── kafka.notification  → request/reply via kafka.adapter
//!     │     └── <consumer targets>  → EventLogger
//!     │
//!     └── kafka-worker (own thread, own runtime)
//!           ├── ProducerWrapper
//!           └── ConsumerWrapper × N ──→ Kafka / emulator
//! ```
//!
//! ## Configuration
//! - BRIDGE_RESOURCE_PATH: directory with application.yaml, kafka-adapter.yaml
//!   and kafka-client.yaml (default: resources)
//! - BRIDGE_LOG: tracing filter (default: info)
//! - Command-line arguments are runtime parameters (`key=value` or `-Dkey=value`)

use std::sync::Arc;

use tracing::{info, warn};

use kafka_bridge::bridge::KafkaBridge;
use kafka_bridge::config::{BridgeConfig, Settings, DEFAULT_NOTIFICATION_ROUTE};
use kafka_bridge::envelope::{Envelope, TYPE_HEADER};
use kafka_bridge::handlers::{BrokerAdapter, EventLogger, KafkaNotification};
use kafka_bridge::routing::{EventRouter, LocalRouter, FLOW_PREFIX};
use kafka_bridge::utils::bootstrap::init_tracing;
use kafka_bridge::worker::{START_TYPE, STOP_TYPE};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = BridgeConfig::from_env().with_parameters(std::env::args().skip(1).collect());
    let router = LocalRouter::new();
    let shared: Arc<dyn EventRouter> = Arc::new(router.clone());

    let bridge = KafkaBridge::new(config.clone(), shared.clone(), None);
    router.register(bridge.route(), Arc::new(BrokerAdapter::new(bridge.clone())));
    router.register(
        DEFAULT_NOTIFICATION_ROUTE,
        Arc::new(KafkaNotification::new(shared.clone(), bridge.route())),
    );

    let settings = Settings::load(&config.resource_path, &config.parameters)?;
    for spec in settings.consumer_specs() {
        if spec.target.starts_with(FLOW_PREFIX) {
            warn!(flow = %spec.target, "No workflow engine, flow target will not be served");
        } else if !router.exists(&spec.target) {
            router.register(spec.target.as_str(), Arc::new(EventLogger));
        }
    }

    let start = Envelope::new()
        .with_to(bridge.route())
        .with_header(TYPE_HEADER, START_TYPE);
    shared.send(start).await?;

    info!(
        resource_path = %config.resource_path.display(),
        route = %bridge.route(),
        "kafka-bridge started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stop = Envelope::new()
        .with_to(bridge.route())
        .with_header(TYPE_HEADER, STOP_TYPE);
    shared.send(stop).await?;
    bridge.wait_stopped().await;

    info!("kafka-bridge stopped");
    Ok(())
}

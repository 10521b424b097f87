use super::*;
use crate::config::{ADAPTER_FILE, APPLICATION_FILE};
use crate::envelope::EXEC_TIME_ANNOTATION;
use serial_test::serial;
use std::time::Duration;
use tempfile::TempDir;

const ADAPTER_YAML: &str = r#"
consumer:
  - topic: hello.notice
    target: demo.listener
    group: group-1
    tracing: true
producer:
  enabled: true
"#;

fn resources(adapter: &str, application: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(ADAPTER_FILE), adapter).unwrap();
    std::fs::write(dir.path().join(APPLICATION_FILE), application).unwrap();
    dir
}

fn init_envelope(dir: &TempDir) -> Envelope {
    Envelope::new()
        .with_header(crate::envelope::TYPE_HEADER, INIT_TYPE)
        .with_header(RESOURCE_PATH_HEADER, dir.path().to_string_lossy())
        .with_body(json!([]))
}

fn control(kind: &str) -> Envelope {
    Envelope::new().with_header(crate::envelope::TYPE_HEADER, kind)
}

fn record(headers: &[(&str, &str)], value: &[u8]) -> InboundRecord {
    InboundRecord {
        topic: "hello.notice".to_string(),
        partition: 3,
        key: Some(b"k".to_vec()),
        value: Some(value.to_vec()),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        offset: 42,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Envelope {
    let bytes = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for worker output")
        .expect("worker channel closed");
    Envelope::from_bytes(&bytes).unwrap()
}

// ============================================================================
// Inbound annotation
// ============================================================================

#[test]
fn test_inbound_envelope_metadata() {
    let env = inbound_envelope(
        &record(&[("source", "sensor")], br#"{"profile_id":"100","seq":0}"#),
        "c-1",
        "demo.listener",
        false,
    );

    assert_eq!(env.body, Some(Body::Value(json!({"profile_id": "100", "seq": 0}))));
    assert_eq!(env.header(META_CLIENT), Some("c-1"));
    assert_eq!(env.header(META_TARGET), Some("demo.listener"));
    assert_eq!(env.header(META_TOPIC), Some("hello.notice"));
    assert_eq!(env.header(META_PARTITION), Some("3"));
    assert_eq!(env.header(META_OFFSET), Some("42"));
    assert_eq!(env.header("source"), Some("sensor"));
    assert!(env.header(TRACE_ID_HEADER).is_none());
}

#[test]
fn test_trace_header_normalized_to_lower_case() {
    let env = inbound_envelope(
        &record(&[("X-Trace-Id", "AbC-123")], b"hi"),
        "c-1",
        "demo.listener",
        true,
    );

    assert_eq!(env.header(TRACE_ID_HEADER), Some("AbC-123"));
    assert!(env.header("X-Trace-Id").is_none());
}

#[test]
fn test_tracing_generates_trace_id() {
    let env = inbound_envelope(&record(&[], b"hi"), "c-1", "demo.listener", true);
    let trace_id = env.header(TRACE_ID_HEADER).unwrap();
    assert!(!trace_id.is_empty());
}

#[test]
fn test_broker_headers_cannot_override_metadata() {
    let env = inbound_envelope(
        &record(&[(META_TARGET, "evil.route")], b"hi"),
        "c-1",
        "demo.listener",
        false,
    );
    assert_eq!(env.header(META_TARGET), Some("demo.listener"));
}

// ============================================================================
// Classification helpers
// ============================================================================

#[test]
fn test_outbound_content_requires_topic_and_content() {
    let with_content = Envelope::new()
        .with_header(TOPIC_HEADER, "hello.world")
        .with_body(json!({"content": "hi"}));
    let (topic, content) = outbound_content(&with_content).unwrap();
    assert_eq!(topic, "hello.world");
    assert_eq!(content, Body::text("hi"));

    let no_content = Envelope::new()
        .with_header(TOPIC_HEADER, "hello.world")
        .with_body(json!({"other": 1}));
    assert!(outbound_content(&no_content).is_none());

    let no_topic = Envelope::new().with_body(json!({"content": "hi"}));
    assert!(outbound_content(&no_topic).is_none());
}

#[test]
fn test_outbound_raw_bytes() {
    let env = Envelope::new()
        .with_header(TOPIC_HEADER, "files")
        .with_body(vec![0u8, 159, 146, 150]);
    let (_, content) = outbound_content(&env).unwrap();
    assert_eq!(content, Body::Bytes(vec![0u8, 159, 146, 150]));
}

#[test]
fn test_confirmation_shape() {
    let body = confirmation("hello.world", EVENT_SENT);
    assert_eq!(body["topic"], "hello.world");
    assert_eq!(body["message"], "Event sent");
    assert!(body["time"].as_str().is_some_and(|t| !t.is_empty()));
}

#[test]
fn test_runtime_parameters_from_body() {
    let body = Body::Value(json!(["a=1", 2, "-Db=2"]));
    assert_eq!(runtime_parameters(Some(&body)), vec!["a=1", "-Db=2"]);
    assert!(runtime_parameters(Some(&Body::text("x"))).is_empty());
    assert!(runtime_parameters(None).is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_lifecycle_transitions() {
    let dir = resources(ADAPTER_YAML, "emulate:\n  kafka: true\n");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);
    assert_eq!(worker.state(), WorkerState::Uninitialized);

    worker.handle(init_envelope(&dir)).await;
    assert_eq!(worker.state(), WorkerState::Initialized);

    worker.handle(control(START_TYPE)).await;
    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(worker.consumers.len(), 1);
    assert!(worker.producer.is_some());

    // second start is a no-op
    worker.handle(control(START_TYPE)).await;
    assert_eq!(worker.consumers.len(), 1);

    let stop = control(STOP_TYPE);
    let stop_id = stop.id.clone();
    worker.handle(stop).await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(recv(&mut rx).await.id, stop_id);

    worker.handle(control(STOP_TYPE)).await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_start_without_init_stops_worker() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);

    worker.handle(control(START_TYPE)).await;

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
#[serial]
async fn test_missing_brokers_is_fatal() {
    let dir = resources(ADAPTER_YAML, "emulate:\n  kafka: false\n");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);

    worker.handle(init_envelope(&dir)).await;
    worker.handle(control(START_TYPE)).await;

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(worker.consumers.is_empty());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_outbound_without_producer_reports_503() {
    let dir = resources("producer:\n  enabled: false\n", "emulate:\n  kafka: true\n");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);
    worker.handle(init_envelope(&dir)).await;
    worker.handle(control(START_TYPE)).await;

    worker
        .handle(
            Envelope::new()
                .with_header(TOPIC_HEADER, "hello.world")
                .with_body(json!({"content": "hi"})),
        )
        .await;

    let reply = recv(&mut rx).await;
    assert_eq!(reply.status, Some(503));
    assert_eq!(reply.body.unwrap().field("topic"), Some(&json!("hello.world")));
}

#[tokio::test]
async fn test_ack_and_rejection_reach_consumer() {
    let dir = resources(ADAPTER_YAML, "emulate:\n  kafka: true\n");
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);
    worker.handle(init_envelope(&dir)).await;
    worker.handle(control(START_TYPE)).await;
    let consumer_id = worker.consumers.keys().next().cloned().unwrap();

    worker
        .handle(Envelope::new().with_correlation_id(consumer_id.clone()))
        .await;
    worker
        .handle(
            Envelope::new()
                .with_correlation_id(consumer_id.clone())
                .with_status(500),
        )
        .await;
    worker
        .handle(
            control(EXCEPTION_TYPE)
                .with_header(CLIENT_HEADER, consumer_id.clone())
                .with_body("route no.such.route not found"),
        )
        .await;

    let stats = worker.consumers[&consumer_id].wrapper.stats();
    assert_eq!((stats.acks, stats.nacks, stats.rejections), (1, 1, 1));
}

#[tokio::test]
async fn test_unclassified_envelope_passes_through() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = WorkerRuntime::new(tx);
    let mut env = Envelope::new()
        .with_to("somewhere")
        .with_header("k", "v")
        .with_body(json!({"x": 1}));
    env.annotations
        .insert(EXEC_TIME_ANNOTATION.to_string(), "0.250".to_string());

    worker.handle(env.clone()).await;

    let forwarded = recv(&mut rx).await;
    assert!(forwarded.annotations.is_empty());
    assert_eq!(forwarded, env.sanitized_copy());
}

#[tokio::test]
async fn test_run_loop_publishes_and_forwards_records() {
    let dir = resources(ADAPTER_YAML, "emulate:\n  kafka: true\n");
    let (to_host, mut from_worker) = mpsc::unbounded_channel();
    let (to_worker, inbox) = mpsc::unbounded_channel();
    let handle = tokio::spawn(WorkerRuntime::new(to_host).run(inbox));

    to_worker.send(init_envelope(&dir).to_bytes()).unwrap();
    to_worker.send(control(START_TYPE).to_bytes()).unwrap();

    let mut outbound = Envelope::new()
        .with_header(TOPIC_HEADER, "hello.notice")
        .with_body(json!({"content": {"profile_id": "100", "seq": 0}}));
    outbound.trace_id = Some("trace-9".to_string());
    to_worker.send(outbound.to_bytes()).unwrap();

    let mut confirmation = None;
    let mut inbound = None;
    for _ in 0..2 {
        let env = recv(&mut from_worker).await;
        if env.header(META_CLIENT).is_some() {
            inbound = Some(env);
        } else {
            confirmation = Some(env);
        }
    }

    let confirmation = confirmation.unwrap();
    assert_eq!(confirmation.id, outbound.id);
    assert_eq!(confirmation.status, None);
    assert_eq!(
        confirmation.body.unwrap().field("message"),
        Some(&json!("Event sent"))
    );

    let inbound = inbound.unwrap();
    assert_eq!(
        inbound.body,
        Some(Body::Value(json!({"profile_id": "100", "seq": 0})))
    );
    assert_eq!(inbound.header(META_TOPIC), Some("hello.notice"));
    assert_eq!(inbound.header(META_TARGET), Some("demo.listener"));
    assert_eq!(inbound.header(TRACE_ID_HEADER), Some("trace-9"));

    to_worker.send(control(STOP_TYPE).to_bytes()).unwrap();
    assert_eq!(recv(&mut from_worker).await.message_type(), Some(STOP_TYPE));
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

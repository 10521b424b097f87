use super::*;

fn settings_with_brokers(brokers: &[&str]) -> Settings {
    Settings {
        brokers: brokers.iter().map(|b| b.to_string()).collect(),
        ..Settings::default()
    }
}

#[test]
fn test_from_settings_joins_brokers() {
    let settings = settings_with_brokers(&["k1:9092", "k2:9092"]);
    let client = KafkaClient::from_settings(&settings).unwrap();
    assert_eq!(client.bootstrap_servers, "k1:9092,k2:9092");
    assert!(client.client_id.starts_with("kafka-bridge-"));
}

#[test]
fn test_from_settings_requires_brokers() {
    let settings = settings_with_brokers(&[]);
    assert!(matches!(
        KafkaClient::from_settings(&settings),
        Err(ConfigError::MissingBrokers)
    ));
}

#[test]
fn test_from_settings_uses_client_id() {
    let mut settings = settings_with_brokers(&["k1:9092"]);
    settings.client_id = Some("bridge-a".to_string());
    let client = KafkaClient::from_settings(&settings).unwrap();
    assert_eq!(client.client_id, "bridge-a");
}

#[test]
fn test_consumer_config_uses_auto_commit() {
    let client = KafkaClient::new("localhost:9092");
    let config = client.build_consumer_config("group-1");
    assert_eq!(config.get("group.id"), Some("group-1"));
    assert_eq!(config.get("enable.auto.commit"), Some("true"));
    assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
}

#[test]
fn test_security_config_applied() {
    let mut client = KafkaClient::new("localhost:9092");
    client.security = SecurityConfig {
        protocol: Some("SASL_SSL".to_string()),
        sasl_username: Some("user".to_string()),
        sasl_password: Some("pass".to_string()),
        sasl_mechanism: Some("SCRAM-SHA-256".to_string()),
        ssl_ca_location: Some("/path/to/ca.crt".to_string()),
    };

    let config = client.build_producer_config();

    assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
    assert_eq!(config.get("sasl.username"), Some("user"));
    assert_eq!(config.get("sasl.password"), Some("pass"));
    assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
    assert_eq!(config.get("ssl.ca.location"), Some("/path/to/ca.crt"));
}

#[test]
fn test_plain_config_has_no_security() {
    let config = KafkaClient::new("localhost:9092").build_producer_config();
    assert_eq!(config.get("security.protocol"), None);
    assert_eq!(config.get("sasl.username"), None);
}

#[tokio::test]
async fn test_flush_reports_undelivered_messages() {
    let producer: FutureProducer = KafkaClient::new("localhost:1")
        .build_producer_config()
        .create()
        .unwrap();
    producer
        .send_result(FutureRecord::to("hello.world").key("k").payload("hi"))
        .map_err(|(e, _)| e)
        .unwrap();

    let result = flush(producer, Duration::from_millis(100)).await;

    assert!(matches!(result, Err(BusError::Publish(_))));
}

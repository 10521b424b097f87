//! Configuration.
//!
//! Host side: [`BridgeConfig`] names the resource directory, the runtime
//! parameters and the adapter route.
//!
//! Worker side: [`Settings`] is loaded inside the worker from the resource
//! directory named by the `init` control message. Sources, later overriding
//! earlier:
//! 1. `application.yaml`
//! 2. `kafka-adapter.yaml`
//! 3. `kafka-client.yaml`
//! 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
//! 5. Runtime parameters (`key=value` or `-Dkey=value`)

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

/// Application configuration file.
pub const APPLICATION_FILE: &str = "application.yaml";
/// Consumer/producer adapter configuration file.
pub const ADAPTER_FILE: &str = "kafka-adapter.yaml";
/// Broker client configuration file.
pub const CLIENT_FILE: &str = "kafka-client.yaml";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BRIDGE";
/// Environment variable for the resource directory.
pub const RESOURCE_PATH_ENV_VAR: &str = "BRIDGE_RESOURCE_PATH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BRIDGE_LOG";
/// Default resource directory.
pub const DEFAULT_RESOURCE_PATH: &str = "resources";
/// Default route name of the adapter front.
pub const DEFAULT_ADAPTER_ROUTE: &str = "kafka.adapter";
/// Default route name of the notification publisher.
pub const DEFAULT_NOTIFICATION_ROUTE: &str = "kafka.notification";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing brokers in {CLIENT_FILE}")]
    MissingBrokers,

    #[error("Kafka support requires the 'kafka' feature. Rebuild with --features kafka")]
    KafkaUnavailable,

    #[error("Invalid runtime parameter '{0}', expected key=value")]
    InvalidParameter(String),

    #[error("Worker has not been initialized")]
    NotInitialized,

    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

// ============================================================================
// Host
// ============================================================================

/// Host-side bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding the worker's configuration files.
    pub resource_path: PathBuf,
    /// Runtime parameters passed to the worker with `init`.
    pub parameters: Vec<String>,
    /// Route name of the adapter front; used as reply-to for inbound events.
    pub route: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resource_path: PathBuf::from(DEFAULT_RESOURCE_PATH),
            parameters: Vec::new(),
            route: DEFAULT_ADAPTER_ROUTE.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Resource path from `RESOURCE_PATH_ENV_VAR`, else the default.
    pub fn from_env() -> Self {
        let resource_path = std::env::var(RESOURCE_PATH_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RESOURCE_PATH));
        Self {
            resource_path,
            ..Self::default()
        }
    }

    pub fn with_resource_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resource_path = path.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Worker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Emulator switch (`emulate.kafka`).
    pub emulate: EmulateConfig,
    /// Consumer entries.
    pub consumer: Vec<ConsumerEntry>,
    /// Producer section.
    pub producer: ProducerConfig,
    /// Broker addresses; required outside emulator mode.
    pub brokers: Vec<String>,
    /// Client id presented to the broker.
    pub client_id: Option<String>,
    /// Broker security settings.
    pub security: SecurityConfig,
    /// Topics to provision at start-up (real broker only).
    pub topics: Vec<TopicSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmulateConfig {
    pub kafka: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub enabled: bool,
}

/// Raw consumer entry as written in `kafka-adapter.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerEntry {
    pub topic: Option<String>,
    pub target: Option<String>,
    pub group: Option<String>,
    pub tracing: bool,
}

/// Validated consumer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub topic: String,
    pub target: String,
    pub group: String,
    pub tracing: bool,
}

impl ConsumerEntry {
    /// Validate the entry; `topic`, `target` and `group` must be non-empty.
    pub fn validate(&self) -> Option<ConsumerSpec> {
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.is_empty()).cloned();
        Some(ConsumerSpec {
            topic: non_empty(&self.topic)?,
            target: non_empty(&self.target)?,
            group: non_empty(&self.group)?,
            tracing: self.tracing,
        })
    }
}

/// Broker security settings (SASL / TLS).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub protocol: Option<String>,
    /// SASL username.
    pub sasl_username: Option<String>,
    /// SASL password.
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// SSL CA certificate path.
    pub ssl_ca_location: Option<String>,
}

/// Topic to provision on the real broker.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication")]
    pub replication: i32,
}

fn default_partitions() -> i32 {
    1
}

fn default_replication() -> i32 {
    1
}

impl Settings {
    /// Load worker settings scoped to `resource_path`.
    pub fn load(resource_path: &Path, parameters: &[String]) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();
        for name in [APPLICATION_FILE, ADAPTER_FILE, CLIENT_FILE] {
            let path = resource_path.join(name);
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Yaml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for param in parameters {
            let (key, value) = parse_parameter(param)?;
            builder = builder.set_override(key, value)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Valid consumer entries; invalid ones are logged and skipped.
    pub fn consumer_specs(&self) -> Vec<ConsumerSpec> {
        self.consumer
            .iter()
            .filter_map(|entry| {
                let spec = entry.validate();
                if spec.is_none() {
                    error!(
                        entry = ?entry,
                        "Each consumer entry must contain topic, target and group"
                    );
                }
                spec
            })
            .collect()
    }

    /// Broker addresses, required and non-empty outside emulator mode.
    pub fn require_brokers(&self) -> Result<&[String], ConfigError> {
        let brokers: &[String] = &self.brokers;
        if brokers.is_empty() || brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::MissingBrokers);
        }
        Ok(brokers)
    }
}

/// Split a runtime parameter into key and value.
///
/// Accepts `key=value` and the JVM-style `-Dkey=value`.
pub fn parse_parameter(param: &str) -> Result<(String, String), ConfigError> {
    let trimmed = param.strip_prefix("-D").unwrap_or(param);
    match trimmed.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidParameter(param.to_string())),
    }
}

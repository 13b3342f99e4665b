//! Broker and storage configuration.
//!
//! A reader is built from a [`ReaderConfig`], whose [`BrokerConfig`] names exactly
//! one backend. Configuration loaders that only know the flat, three-section
//! layout (every backend present, at most one filled in) use
//! [`BrokerSettings::select`] to turn it into a `BrokerConfig`.

use crate::broker::BrokerKind;
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const REDACTED: &str = "<redacted>";

fn redact(value: &str) -> &str {
    if value.is_empty() {
        ""
    } else {
        REDACTED
    }
}

fn default_poll_secs() -> u64 {
    3
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_message_group_id() -> String {
    "default".to_string()
}

fn default_target_topic() -> String {
    "kcloud-analysis-queue".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

/// RabbitMQ source/target configuration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AmqpConfig {
    /// Quorum queue messages are read from
    pub queue_name: String,
    /// Routing key used by `send`
    pub target_queue_name: String,
    pub exchange: String,
    /// Bare host (`rabbit:5672`) or URL with `amqp://` / `amqps://` scheme
    pub host: String,
    pub username: String,
    pub password: String,
    /// Sleep after an empty poll; `0` returns immediately
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
}

impl AmqpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            target_queue_name: String::new(),
            exchange: String::new(),
            host: String::new(),
            username: String::new(),
            password: String::new(),
            poll_interval_secs: default_poll_secs(),
        }
    }
}

impl fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("queue_name", &self.queue_name)
            .field("target_queue_name", &self.target_queue_name)
            .field("exchange", &self.exchange)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

/// AWS SQS configuration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SqsConfig {
    pub queue_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Override for the SQS endpoint (LocalStack, tests)
    pub endpoint: Option<String>,
    /// Message group used when sending to a FIFO queue
    #[serde(default = "default_message_group_id")]
    pub message_group_id: String,
}

impl SqsConfig {
    /// Endpoint requests are sent to
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) if !endpoint.is_empty() => endpoint.trim_end_matches('/').to_string(),
            _ => format!("https://sqs.{}.amazonaws.com", self.region),
        }
    }
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: default_region(),
            endpoint: None,
            message_group_id: default_message_group_id(),
        }
    }
}

impl fmt::Debug for SqsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsConfig")
            .field("queue_name", &self.queue_name)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("message_group_id", &self.message_group_id)
            .finish()
    }
}

/// Kafka consumer group and producer configuration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KafkaConfig {
    /// Topic consumed by `receive`
    pub topic_name: String,
    /// Topic written by `send`
    #[serde(default = "default_target_topic")]
    pub target_topic: String,
    /// `bootstrap.servers`
    pub broker: String,
    pub group_id: String,
    /// `sasl.mechanisms`, e.g. `PLAIN` or `SCRAM-SHA-512`
    pub mechanism: String,
    /// `security.protocol`, e.g. `SASL_SSL`
    pub security: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_poll_secs")]
    pub poll_timeout_secs: u64,
}

impl KafkaConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            topic_name: String::new(),
            target_topic: default_target_topic(),
            broker: String::new(),
            group_id: String::new(),
            mechanism: String::new(),
            security: String::new(),
            username: String::new(),
            password: String::new(),
            poll_timeout_secs: default_poll_secs(),
        }
    }
}

impl fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("topic_name", &self.topic_name)
            .field("target_topic", &self.target_topic)
            .field("broker", &self.broker)
            .field("group_id", &self.group_id)
            .field("mechanism", &self.mechanism)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

/// Exactly one backend to read from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerConfig {
    Amqp(AmqpConfig),
    Sqs(SqsConfig),
    Kafka(KafkaConfig),
}

impl BrokerConfig {
    pub fn kind(&self) -> BrokerKind {
        match self {
            Self::Amqp(_) => BrokerKind::Amqp,
            Self::Sqs(_) => BrokerKind::Sqs,
            Self::Kafka(_) => BrokerKind::Kafka,
        }
    }
}

/// Flat settings with one section per backend
///
/// Mirrors how the settings are usually supplied (environment variables for all
/// three backends, only one of them filled in).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSettings {
    pub amqp: AmqpConfig,
    pub sqs: SqsConfig,
    pub kafka: KafkaConfig,
}

impl BrokerSettings {
    /// Pick the backend whose source queue is configured
    ///
    /// Priority is AMQP, then SQS, then Kafka. Later sections are ignored once
    /// one is selected.
    pub fn select(self) -> Result<BrokerConfig, ConfigurationError> {
        if !self.amqp.queue_name.is_empty() {
            Ok(BrokerConfig::Amqp(self.amqp))
        } else if !self.sqs.queue_name.is_empty() {
            Ok(BrokerConfig::Sqs(self.sqs))
        } else if !self.kafka.topic_name.is_empty() {
            Ok(BrokerConfig::Kafka(self.kafka))
        } else {
            Err(ConfigurationError::NoBrokerSelected)
        }
    }
}

/// Storage service the referenced blobs are fetched from
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Base URI; blobs are fetched from `{uri}/storage/blob`
    pub uri: String,
    pub access_key: String,
    pub secret: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl StorageConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            access_key: String::new(),
            secret: String::new(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("uri", &self.uri)
            .field("access_key", &self.access_key)
            .field("secret", &redact(&self.secret))
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .finish()
    }
}

/// Everything needed to build a [`crate::QueueReader`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReaderConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

//! Kafka adapter over a consumer group and an asynchronous producer.
//!
//! ## Receiving
//!
//! `receive` polls the consumer for at most [`KafkaConfig::poll_timeout`] and returns
//! zero or one message. Offsets are committed automatically by the client.
//!
//! ## Sending and delivery reports
//!
//! `send` enqueues the payload on the producer and returns without waiting for the
//! broker. Each enqueue yields a [`PendingDelivery`] that a spawned task awaits;
//! its outcome is always logged. Once [`KafkaBroker::take_delivery_reports`] has
//! handed out a receiver, outcomes are also published on it as [`DeliveryReport`]s.
//! Before that nothing is buffered.
//!
//! When the producer's local queue is full, `send` waits one second and retries
//! once. If the queue is still full the payload is dropped: a warning is logged,
//! a [`DeliveryReport::Failed`] is emitted and `send` returns `Ok(())`.

use crate::broker::{decode_or_skip, BrokerKind, MessageBroker};
use crate::config::KafkaConfig;
use crate::error::{BrokerError, ConfigurationError};
use crate::message::Message;
use crate::providers::kafka_rdkafka::{RdKafkaConsumer, RdKafkaProducer};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "kafka_tests.rs"]
mod tests;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_secs(1);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Delivery Reports
// ============================================================================

/// Outcome of one produced message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Failed {
        topic: String,
        reason: String,
    },
}

/// Resolves once the broker has acknowledged (or rejected) a produced message
pub type PendingDelivery = Pin<Box<dyn Future<Output = DeliveryReport> + Send>>;

/// Why a message could not be handed to the producer
#[derive(Debug)]
pub enum EnqueueError {
    /// The producer's local buffer is full
    QueueFull,
    Other(BrokerError),
}

// ============================================================================
// Client Traits
// ============================================================================

/// Consumer side of a Kafka client
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Wait up to `timeout` for the next record's payload
    ///
    /// A record without a payload yields `Some` of an empty vector.
    async fn poll(&self, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Leave the consumer group
    fn close(&self);
}

/// Producer side of a Kafka client
#[async_trait]
pub trait LogProducer: Send + Sync {
    fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<PendingDelivery, EnqueueError>;

    /// Wait for buffered messages to be delivered
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

// ============================================================================
// Adapter
// ============================================================================

/// Kafka implementation of [`MessageBroker`]
pub struct KafkaBroker {
    config: KafkaConfig,
    consumer: Option<Box<dyn LogConsumer>>,
    producer: Option<Box<dyn LogProducer>>,
    /// Set once a receiver has been handed out
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    queue_full_backoff: Duration,
}

impl KafkaBroker {
    /// Connect with `rdkafka`, subscribing the consumer to `topic_name`
    pub async fn connect(config: KafkaConfig) -> Result<Self, BrokerError> {
        validate(&config)?;

        let consumer = RdKafkaConsumer::subscribe(&config)?;
        let producer = RdKafkaProducer::create(&config)?;

        info!(
            topic = %config.topic_name,
            group_id = %config.group_id,
            target = %config.target_topic,
            "Connected to Kafka"
        );

        Self::with_clients(config, Box::new(consumer), Box::new(producer))
    }

    /// Build the adapter from existing clients
    pub fn with_clients(
        config: KafkaConfig,
        consumer: Box<dyn LogConsumer>,
        producer: Box<dyn LogProducer>,
    ) -> Result<Self, BrokerError> {
        validate(&config)?;

        Ok(Self {
            config,
            consumer: Some(consumer),
            producer: Some(producer),
            reports: None,
            queue_full_backoff: QUEUE_FULL_BACKOFF,
        })
    }

    /// Start publishing delivery reports and hand out their receiver
    ///
    /// Returns `None` after the first call. Only sends made after this call are
    /// reported, and the holder is expected to drain the receiver.
    pub fn take_delivery_reports(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        if self.reports.is_some() {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        Some(rx)
    }

    fn closed() -> BrokerError {
        BrokerError::Closed {
            broker: BrokerKind::Kafka,
        }
    }

    fn report_dropped(&self, reason: &str) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(DeliveryReport::Failed {
                topic: self.config.target_topic.clone(),
                reason: reason.to_string(),
            });
        }
    }

    fn track(&self, pending: PendingDelivery) {
        let reports = self.reports.clone();
        tokio::spawn(async move {
            let report = pending.await;
            match &report {
                DeliveryReport::Delivered {
                    topic,
                    partition,
                    offset,
                } => info!(%topic, partition, offset, "Delivered Kafka message"),
                DeliveryReport::Failed { topic, reason } => {
                    error!(%topic, %reason, "Kafka delivery failed")
                }
            }
            // The receiver may have been dropped; the outcome is already logged.
            if let Some(reports) = reports {
                let _ = reports.send(report);
            }
        });
    }
}

fn validate(config: &KafkaConfig) -> Result<(), ConfigurationError> {
    for (key, value) in [
        ("kafka.topic_name", &config.topic_name),
        ("kafka.broker", &config.broker),
        ("kafka.group_id", &config.group_id),
        ("kafka.target_topic", &config.target_topic),
    ] {
        if value.is_empty() {
            return Err(ConfigurationError::Missing {
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

impl fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("config", &self.config)
            .field("closed", &self.producer.is_none())
            .finish()
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn receive(&mut self) -> Result<Vec<Message>, BrokerError> {
        let consumer = self.consumer.as_ref().ok_or_else(Self::closed)?;

        match consumer.poll(self.config.poll_timeout()).await? {
            None => {
                debug!(topic = %self.config.topic_name, "No Kafka message within poll timeout");
                Ok(Vec::new())
            }
            Some(payload) if payload.is_empty() => {
                debug!(topic = %self.config.topic_name, "Skipping Kafka record without payload");
                Ok(Vec::new())
            }
            Some(payload) => Ok(decode_or_skip(BrokerKind::Kafka, &payload)
                .into_iter()
                .collect()),
        }
    }

    async fn send(&mut self, payload: &str) -> Result<(), BrokerError> {
        let producer = self.producer.as_ref().ok_or_else(Self::closed)?;

        if let Some(max_size) = BrokerKind::Kafka.max_message_size() {
            if payload.len() > max_size {
                return Err(BrokerError::MessageTooLarge {
                    size: payload.len(),
                    max_size,
                });
            }
        }

        let topic = &self.config.target_topic;
        let pending = match producer.enqueue(topic, payload.as_bytes()) {
            Ok(pending) => pending,
            Err(EnqueueError::QueueFull) => {
                warn!(%topic, backoff = ?self.queue_full_backoff, "Kafka producer queue full, retrying");
                tokio::time::sleep(self.queue_full_backoff).await;

                match producer.enqueue(topic, payload.as_bytes()) {
                    Ok(pending) => pending,
                    Err(EnqueueError::QueueFull) => {
                        warn!(%topic, "Kafka producer queue still full, dropping message");
                        self.report_dropped("producer queue full");
                        return Ok(());
                    }
                    Err(EnqueueError::Other(e)) => return Err(e),
                }
            }
            Err(EnqueueError::Other(e)) => return Err(e),
        };

        self.track(pending);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.close();
        }

        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT).await {
                warn!(error = %e, "Failed to flush Kafka producer");
            }
        }

        Ok(())
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }
}

//! `rdkafka` implementation of the Kafka client traits.

use super::kafka::{DeliveryReport, EnqueueError, LogConsumer, LogProducer, PendingDelivery};
use crate::broker::BrokerKind;
use crate::config::KafkaConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message as _;
use std::time::Duration;

/// Settings shared by the consumer and the producer
fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.broker);

    for (key, value) in [
        ("sasl.mechanisms", &config.mechanism),
        ("security.protocol", &config.security),
        ("sasl.username", &config.username),
        ("sasl.password", &config.password),
    ] {
        if !value.is_empty() {
            client.set(key, value);
        }
    }

    client
}

fn map_kafka_error(error: KafkaError) -> BrokerError {
    let code = error
        .rdkafka_error_code()
        .map(|code| format!("{:?}", code))
        .unwrap_or_else(|| "client".to_string());

    BrokerError::ProviderError {
        provider: BrokerKind::Kafka,
        code,
        message: error.to_string(),
    }
}

pub(crate) struct RdKafkaConsumer {
    consumer: StreamConsumer,
}

impl RdKafkaConsumer {
    pub(crate) fn subscribe(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = base_config(config)
            .set("group.id", &config.group_id)
            .set("session.timeout.ms", "60000")
            .set("max.poll.interval.ms", "60000")
            .set("queued.max.messages.kbytes", "1000000")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::ConnectionFailed {
                message: format!("Failed to create Kafka consumer: {}", e),
            })?;

        consumer
            .subscribe(&[config.topic_name.as_str()])
            .map_err(map_kafka_error)?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(map_kafka_error(e)),
            Ok(Ok(message)) => Ok(Some(message.payload().map(<[u8]>::to_vec).unwrap_or_default())),
        }
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

pub(crate) struct RdKafkaProducer {
    producer: FutureProducer,
}

impl RdKafkaProducer {
    pub(crate) fn create(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer =
            base_config(config)
                .create()
                .map_err(|e| BrokerError::ConnectionFailed {
                    message: format!("Failed to create Kafka producer: {}", e),
                })?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<PendingDelivery, EnqueueError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                return Err(EnqueueError::QueueFull)
            }
            Err((e, _)) => return Err(EnqueueError::Other(map_kafka_error(e))),
        };

        let topic = topic.to_string();
        Ok(Box::pin(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => DeliveryReport::Delivered {
                    topic,
                    partition,
                    offset,
                },
                Ok(Err((e, _))) => DeliveryReport::Failed {
                    topic,
                    reason: e.to_string(),
                },
                Err(_) => DeliveryReport::Failed {
                    topic,
                    reason: "delivery canceled".to_string(),
                },
            }
        }))
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        // librdkafka's flush blocks the calling thread.
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::ProviderError {
                provider: BrokerKind::Kafka,
                code: "flush".to_string(),
                message: e.to_string(),
            })?
            .map_err(map_kafka_error)
    }
}

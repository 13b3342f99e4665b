//! Queue adapter implementations.
//!
//! One [`MessageBroker`](crate::broker::MessageBroker) implementation per backend:
//! RabbitMQ ([`AmqpBroker`]), AWS SQS ([`SqsBroker`]) and Kafka ([`KafkaBroker`]).
//! [`InMemoryAmqpServer`] stands in for RabbitMQ in tests and local development.

pub mod amqp;
mod amqp_lapin;
pub mod kafka;
mod kafka_rdkafka;
pub mod memory;
pub mod sqs;

pub use amqp::{amqp_url, AmqpBroker, AmqpChannel, AmqpConnection, AmqpConnector};
pub use amqp_lapin::LapinConnector;
pub use kafka::{
    DeliveryReport, EnqueueError, KafkaBroker, LogConsumer, LogProducer, PendingDelivery,
};
pub use memory::{AmqpFault, InMemoryAmqpServer, PublishedMessage};
pub use sqs::SqsBroker;

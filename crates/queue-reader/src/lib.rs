//! # Queue Reader
//!
//! One pull-based consumer/producer interface over RabbitMQ, AWS SQS and Kafka, and
//! a pipeline that fetches the storage blob each message refers to.
//!
//! ## Module Organization
//!
//! - [`broker`] - The [`MessageBroker`] trait every backend implements
//! - [`providers`] - RabbitMQ, SQS and Kafka adapters plus an in-memory RabbitMQ
//! - [`message`] - Decoded messages and blob references
//! - [`blob`] - Storage access through a [`BlobResolver`]
//! - [`reader`] - [`QueueReader`], the receive-and-hydrate pipeline
//! - [`config`] - Backend and storage configuration
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```no_run
//! use queue_reader::{AmqpConfig, BrokerConfig, HydrationMode, QueueReader, ReaderConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReaderConfig {
//!     broker: BrokerConfig::Amqp(AmqpConfig {
//!         queue_name: "frames".to_string(),
//!         host: "rabbit:5672".to_string(),
//!         username: "guest".to_string(),
//!         password: "guest".to_string(),
//!         ..AmqpConfig::default()
//!     }),
//!     storage: Default::default(),
//! };
//!
//! let mut reader = QueueReader::connect(config).await?;
//! let mode = HydrationMode::File("frame.mp4".into());
//! if let Some(hydrated) = reader.receive_and_hydrate(&mode).await {
//!     println!("{:?}", hydrated);
//! }
//! reader.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod providers;
pub mod reader;

pub use blob::{BlobResolver, VaultBlobResolver};
pub use broker::{BrokerKind, MessageBroker};
pub use config::{
    AmqpConfig, BrokerConfig, BrokerSettings, KafkaConfig, ReaderConfig, SqsConfig,
    StorageConfig,
};
pub use error::{BrokerError, ConfigurationError, HydrationError, MessageError, ReaderError};
pub use message::{BlobReference, Message};
pub use providers::{AmqpBroker, DeliveryReport, InMemoryAmqpServer, KafkaBroker, SqsBroker};
pub use reader::{Hydrated, HydrationMode, QueueReader};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

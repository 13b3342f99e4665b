//! The queue adapter interface shared by every backend.

use crate::error::BrokerError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Backend behind a [`MessageBroker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Amqp,
    Sqs,
    Kafka,
}

impl BrokerKind {
    /// Largest payload accepted by `send`, if the backend enforces one
    pub fn max_message_size(&self) -> Option<usize> {
        match self {
            Self::Amqp => None,
            Self::Sqs => Some(256 * 1024),
            Self::Kafka => Some(1024 * 1024),
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Amqp => "amqp",
            Self::Sqs => "sqs",
            Self::Kafka => "kafka",
        };
        f.write_str(name)
    }
}

/// Pull-based consumption and production over one backend
///
/// Implementations own their connection state exclusively and are not safe for
/// concurrent use, hence `&mut self` on every operation.
#[async_trait]
pub trait MessageBroker: Send {
    /// Fetch the next batch of decoded messages
    ///
    /// Returns an empty vector when nothing is available. Every call waits a
    /// bounded amount of time before returning.
    async fn receive(&mut self) -> Result<Vec<Message>, BrokerError>;

    /// Publish a serialized payload to the backend's configured target
    async fn send(&mut self, payload: &str) -> Result<(), BrokerError>;

    /// Release backend connections
    async fn close(&mut self) -> Result<(), BrokerError>;

    /// Backend this adapter talks to
    fn kind(&self) -> BrokerKind;
}

/// Decode a raw body, logging and dropping it when malformed
pub(crate) fn decode_or_skip(kind: BrokerKind, body: &[u8]) -> Option<Message> {
    match Message::decode(body) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(
                broker = %kind,
                error = %e,
                body_len = body.len(),
                "Skipping malformed message"
            );
            None
        }
    }
}

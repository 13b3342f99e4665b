//! `lapin` implementation of the AMQP transport traits.

use super::amqp::{AmqpChannel, AmqpConnection, AmqpConnector};
use crate::broker::BrokerKind;
use crate::error::BrokerError;
use async_trait::async_trait;
use lapin::options::{BasicGetOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

#[cfg(test)]
#[path = "amqp_lapin_tests.rs"]
mod tests;

/// Connects to RabbitMQ with `lapin`
#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn AmqpConnection>, BrokerError> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                message: e.to_string(),
            })?;
        Ok(Box::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(map_lapin_error)?;
        Ok(Box::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "closing")
            .await
            .map_err(map_lapin_error)
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_quorum_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString(LongString::from("quorum")),
        );

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(map_lapin_error)?;
        Ok(message.map(|message| message.delivery.data))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        confirm.await.map(|_| ()).map_err(map_lapin_error)
    }
}

/// Classify `lapin` errors into connection-level and channel-level closures
/// Classify a lapin error for the adapter's recovery logic
///
/// Operations on the channels of a dead connection fail with
/// `InvalidChannelState`, so `ChannelClosed` does not imply the connection is
/// still usable.
fn map_lapin_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::InvalidConnectionState(state) => BrokerError::ConnectionClosed {
            message: format!("connection state {:?}", state),
        },
        lapin::Error::IOError(e) => BrokerError::ConnectionClosed {
            message: e.to_string(),
        },
        lapin::Error::MissingHeartbeatError => BrokerError::ConnectionClosed {
            message: "missing heartbeat".to_string(),
        },
        lapin::Error::InvalidChannelState(state) => BrokerError::ChannelClosed {
            message: format!("channel state {:?}", state),
        },
        other => BrokerError::ProviderError {
            provider: BrokerKind::Amqp,
            code: "lapin".to_string(),
            message: other.to_string(),
        },
    }
}

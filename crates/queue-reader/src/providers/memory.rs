//! In-memory AMQP broker for testing and development.
//!
//! [`InMemoryAmqpServer`] implements [`AmqpConnector`] on top of shared in-process
//! state, so an [`AmqpBroker`](super::AmqpBroker) can run without RabbitMQ. It
//! models the parts of the broker the adapter depends on:
//! - named queues fed by [`InMemoryAmqpServer::enqueue`] or by publishes to the
//!   default exchange
//! - connection and channel lifecycles, including broker-side closure
//! - injected publish failures, one-shot faults on the next get or publish, and
//!   connections that never open
//!
//! Like lapin, a channel whose connection has died reports every operation as a
//! closed channel, while opening a channel on a dead connection reports a closed
//! connection.
//!
//! Clones share state, so a test keeps one handle while the adapter owns another.

use super::amqp::{AmqpChannel, AmqpConnection, AmqpConnector};
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// A message published through the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// A one-shot failure applied to the next get or publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpFault {
    /// The operation fails with a connection error while the connection still
    /// reports itself open
    ConnectionReset,
    /// The connection dies during the operation, which fails as a closed channel
    ConnectionLost,
    /// The broker closes the channel used for the operation
    ChannelClosed,
}

#[derive(Default)]
struct ServerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    declared: HashSet<String>,
    published: Vec<PublishedMessage>,
    /// Generation of the connection currently considered open
    open_connection: Option<u64>,
    next_connection: u64,
    connections_opened: usize,
    next_channel: u64,
    channels_opened: usize,
    closed_channels: HashSet<u64>,
    failing_publishes: usize,
    pending_fault: Option<AmqpFault>,
    refuse_open: bool,
    unreachable: bool,
}

/// Shared in-process AMQP broker
#[derive(Clone, Default)]
pub struct InMemoryAmqpServer {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryAmqpServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a raw body to a queue
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.into());
    }

    /// Number of messages waiting in a queue
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().declared.contains(queue)
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    /// Close the current connection from the broker side
    pub fn drop_connection(&self) {
        self.lock().open_connection = None;
    }

    /// Close every channel opened so far, leaving the connection open
    pub fn close_channels(&self) {
        let mut state = self.lock();
        let opened = state.next_channel;
        state.closed_channels.extend(0..opened);
    }

    /// Make the next `count` publishes fail with a closed channel
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    /// Fail the next get or publish with `fault`
    pub fn inject_fault(&self, fault: AmqpFault) {
        self.lock().pending_fault = Some(fault);
    }

    /// Hand out connections that never report themselves open
    pub fn refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }

    /// Fail every connection attempt
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }
}

#[async_trait]
impl AmqpConnector for InMemoryAmqpServer {
    async fn connect(&self, url: &str) -> Result<Box<dyn AmqpConnection>, BrokerError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(BrokerError::ConnectionFailed {
                message: format!("broker at {} is unreachable", redact_url(url)),
            });
        }

        let generation = state.next_connection;
        state.next_connection += 1;
        state.connections_opened += 1;
        if !state.refuse_open {
            state.open_connection = Some(generation);
        }

        Ok(Box::new(InMemoryConnection {
            server: self.clone(),
            generation,
        }))
    }
}

fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => host.to_string(),
        None => url.to_string(),
    }
}

struct InMemoryConnection {
    server: InMemoryAmqpServer,
    generation: u64,
}

impl InMemoryConnection {
    fn closed_error(&self) -> BrokerError {
        BrokerError::ConnectionClosed {
            message: format!("in-memory connection {} is closed", self.generation),
        }
    }
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.server.lock().open_connection == Some(self.generation)
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, BrokerError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let mut state = self.server.lock();
        let id = state.next_channel;
        state.next_channel += 1;
        state.channels_opened += 1;

        Ok(Box::new(InMemoryChannel {
            server: self.server.clone(),
            connection: self.generation,
            id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.server.lock();
        if state.open_connection == Some(self.generation) {
            state.open_connection = None;
        }
        Ok(())
    }
}

struct InMemoryChannel {
    server: InMemoryAmqpServer,
    connection: u64,
    id: u64,
}

impl InMemoryChannel {
    /// Fail with the error lapin would raise for this channel's state
    fn check_open(&self, state: &ServerState) -> Result<(), BrokerError> {
        if state.open_connection != Some(self.connection) {
            return Err(BrokerError::ChannelClosed {
                message: format!(
                    "in-memory channel {} lost connection {}",
                    self.id, self.connection
                ),
            });
        }
        if state.closed_channels.contains(&self.id) {
            return Err(BrokerError::ChannelClosed {
                message: format!("in-memory channel {} is closed", self.id),
            });
        }
        Ok(())
    }

    /// Apply a pending one-shot fault, if any
    fn take_fault(&self, state: &mut ServerState) -> Result<(), BrokerError> {
        match state.pending_fault.take() {
            None => Ok(()),
            Some(AmqpFault::ConnectionReset) => Err(BrokerError::ConnectionClosed {
                message: format!("in-memory connection {} reset", self.connection),
            }),
            Some(AmqpFault::ConnectionLost) => {
                state.open_connection = None;
                Err(BrokerError::ChannelClosed {
                    message: format!(
                        "in-memory channel {} lost connection {}",
                        self.id, self.connection
                    ),
                })
            }
            Some(AmqpFault::ChannelClosed) => {
                state.closed_channels.insert(self.id);
                Err(BrokerError::ChannelClosed {
                    message: format!("in-memory channel {} closed by broker", self.id),
                })
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.check_open(&self.server.lock()).is_ok()
    }

    async fn declare_quorum_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.server.lock();
        self.check_open(&state)?;
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut state = self.server.lock();
        self.check_open(&state)?;
        self.take_fault(&mut state)?;
        Ok(state.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.server.lock();
        self.check_open(&state)?;
        self.take_fault(&mut state)?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            state.closed_channels.insert(self.id);
            return Err(BrokerError::ChannelClosed {
                message: format!("in-memory channel {} closed by broker", self.id),
            });
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });

        // The default exchange routes by queue name.
        if exchange.is_empty() {
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.push_back(body.to_vec());
            }
        }

        Ok(())
    }
}

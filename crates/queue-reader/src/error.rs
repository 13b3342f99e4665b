//! Error types for broker, configuration and hydration operations.

use crate::broker::BrokerKind;
use thiserror::Error;

/// Error type for all broker adapter operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection to {broker} is not open after construction")]
    ConnectionNotOpen { broker: BrokerKind },

    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Broker {broker} has been closed")]
    Closed { broker: BrokerKind },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: BrokerKind,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
}

impl BrokerError {
    /// Check if error is transient and the operation may succeed after recovery
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionNotOpen { .. } => false,
            Self::ConnectionClosed { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::Closed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::ConfigurationError(_) => false,
        }
    }

    /// Check if error is fatal for the reader and should stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionNotOpen { .. }
                | Self::QueueNotFound { .. }
                | Self::AuthenticationFailed { .. }
                | Self::ConfigurationError(_)
        )
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error(
        "No broker selected: provide a source queue name for RabbitMQ, AWS SQS or Kafka \
         together with its credentials"
    )]
    NoBrokerSelected,

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors raised while decoding a wire message into a [`crate::Message`]
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Message body must be a JSON object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("Message body is empty")]
    Empty,
}

/// Errors raised while hydrating a single message
///
/// All variants are recoverable per item: the reader logs them and moves on to
/// the next message.
#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("Message field missing or not a string: {field}")]
    MissingField { field: &'static str },

    #[error("Blob resolver failed: {message}")]
    Resolver { message: String },

    #[error("Blob request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Blob request returned status {status}")]
    Status { status: u16 },

    #[error("Failed to write blob to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced from [`crate::QueueReader`] construction and delegation
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

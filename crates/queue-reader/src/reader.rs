//! The consumer pipeline: receive a batch, resolve each message's blob, hand back
//! the first one that could be fetched.

use crate::blob::{BlobResolver, VaultBlobResolver};
use crate::broker::{BrokerKind, MessageBroker};
use crate::config::{BrokerConfig, ReaderConfig};
use crate::error::{BrokerError, HydrationError, ReaderError};
use crate::message::Message;
use crate::providers::{AmqpBroker, KafkaBroker, SqsBroker};
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const BLOB_PATH: &str = "/storage/blob";

/// Where a fetched blob goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationMode {
    /// Write the body to this path, replacing it atomically
    File(PathBuf),
    /// Return the HTTP response without reading the body
    Raw,
}

/// A successfully fetched blob
#[derive(Debug)]
pub enum Hydrated {
    File(PathBuf),
    Raw(reqwest::Response),
}

/// Reads messages from one backend and hydrates the blobs they reference
///
/// The backend is chosen at construction and never changes. Every operation takes
/// `&mut self`; a reader is driven by one task at a time.
pub struct QueueReader {
    broker: Box<dyn MessageBroker>,
    resolver: Box<dyn BlobResolver>,
    http_client: reqwest::Client,
    fetch_timeout: Duration,
}

impl QueueReader {
    /// Connect to the configured backend and storage service
    pub async fn connect(config: ReaderConfig) -> Result<Self, ReaderError> {
        let kind = config.broker.kind();
        let broker: Box<dyn MessageBroker> = match config.broker {
            BrokerConfig::Amqp(amqp) => Box::new(AmqpBroker::connect(amqp).await?),
            BrokerConfig::Sqs(sqs) => Box::new(SqsBroker::connect(sqs).await?),
            BrokerConfig::Kafka(kafka) => Box::new(KafkaBroker::connect(kafka).await?),
        };

        let resolver = VaultBlobResolver::from_config(&config.storage);
        info!(broker = %kind, storage = %resolver.storage_uri(), "Queue reader ready");

        Ok(Self::new(broker, Box::new(resolver))?
            .with_fetch_timeout(config.storage.fetch_timeout()))
    }

    pub fn new(
        broker: Box<dyn MessageBroker>,
        resolver: Box<dyn BlobResolver>,
    ) -> Result<Self, ReaderError> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(ReaderError::HttpClient)?;

        Ok(Self {
            broker,
            resolver,
            http_client,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    /// Bound on each blob request, body included
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn broker_kind(&self) -> BrokerKind {
        self.broker.kind()
    }

    /// Receive one batch and return the first message whose blob could be fetched
    ///
    /// Errors never escape: a failed receive counts as an empty batch, and a
    /// message that cannot be hydrated is logged and skipped. Messages after the
    /// first success are dropped unprocessed.
    pub async fn receive_and_hydrate(&mut self, mode: &HydrationMode) -> Option<Hydrated> {
        let kind = self.broker.kind();
        let messages = match self.broker.receive().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(broker = %kind, error = %e, "Failed to receive messages");
                return None;
            }
        };

        debug!(broker = %kind, count = messages.len(), "Received batch");

        for message in &messages {
            match self.hydrate(message, mode).await {
                Ok(hydrated) => return Some(hydrated),
                Err(e) => warn!(broker = %kind, error = %e, "Skipping message"),
            }
        }

        None
    }

    /// Fetch the blob a single message refers to
    pub async fn hydrate(
        &mut self,
        message: &Message,
        mode: &HydrationMode,
    ) -> Result<Hydrated, HydrationError> {
        if let Some(metadata) = message.storage_metadata() {
            self.resolver.update_storage_info(metadata);
        }

        let reference = message.blob_reference()?;
        let headers = self
            .resolver
            .create_headers(&reference.key, &reference.source)?;
        let url = format!("{}{}", self.resolver.storage_uri(), BLOB_PATH);

        let response = self
            .http_client
            .get(&url)
            .headers(headers)
            .timeout(self.fetch_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HydrationError::Status {
                status: status.as_u16(),
            });
        }

        match mode {
            HydrationMode::Raw => {
                info!(blob = %reference, %status, "Fetched blob");
                Ok(Hydrated::Raw(response))
            }
            HydrationMode::File(path) => {
                let body = response.bytes().await?;
                let size = body.len();
                write_atomically(path, body).await?;
                info!(blob = %reference, path = %path.display(), size, "Hydrated blob");
                Ok(Hydrated::File(path.clone()))
            }
        }
    }

    pub async fn send(&mut self, payload: &str) -> Result<(), BrokerError> {
        self.broker.send(payload).await
    }

    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.broker.close().await
    }
}

/// Write `body` to a temporary file next to `path`, then rename it into place
async fn write_atomically(path: &Path, body: Bytes) -> Result<(), HydrationError> {
    let destination = path.to_path_buf();
    let io_error = |source: std::io::Error| HydrationError::Io {
        path: path.display().to_string(),
        source,
    };

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&body)?;
        file.as_file().sync_all()?;
        file.persist(&destination).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| io_error(std::io::Error::other(e)))?
    .map_err(io_error)
}

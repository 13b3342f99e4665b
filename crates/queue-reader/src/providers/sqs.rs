//! AWS SQS adapter using the Query API over HTTP.
//!
//! Requests are signed with AWS Signature Version 4 and sent with `reqwest`, so the
//! adapter can be exercised against a mock HTTP server (or LocalStack) through
//! [`SqsConfig::endpoint`].
//!
//! ## Delivery model
//!
//! `receive` asks for up to three messages with a 20 second long poll and a 10
//! second visibility timeout, then deletes each message before returning it.
//! A message is only returned when its `DeleteMessage` call succeeded, so this
//! adapter never hands out a message that another consumer may still receive.
//! The flip side: once deleted, a message that the caller fails to process is
//! gone.
//!
//! ## FIFO queues
//!
//! Queues whose name ends in `.fifo` get a `MessageGroupId` (from the config) and a
//! content-based `MessageDeduplicationId` on `send`.

use crate::broker::{decode_or_skip, BrokerKind, MessageBroker};
use crate::config::SqsConfig;
use crate::error::{BrokerError, ConfigurationError};
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";
const MAX_MESSAGES_PER_RECEIVE: u32 = 3;
const WAIT_TIME_SECONDS: u32 = 20;
const VISIBILITY_TIMEOUT_SECONDS: u32 = 10;
const HTTP_TIMEOUT_SECONDS: u64 = 30;

// ============================================================================
// Error Types
// ============================================================================

/// SQS specific errors
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SQS service error: {code}: {message}")]
    Service { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Malformed SQS response: {0}")]
    Serialization(String),
}

impl SqsError {
    fn into_broker_error(self) -> BrokerError {
        match self {
            Self::Authentication(message) => BrokerError::AuthenticationFailed { message },
            Self::Network(message) => BrokerError::ConnectionFailed { message },
            Self::Service { code, message } => BrokerError::ProviderError {
                provider: BrokerKind::Sqs,
                code,
                message,
            },
            Self::QueueNotFound(queue_name) => BrokerError::QueueNotFound { queue_name },
            Self::Serialization(message) => BrokerError::ProviderError {
                provider: BrokerKind::Sqs,
                code: "MalformedResponse".to_string(),
                message,
            },
        }
    }
}

impl From<SqsError> for BrokerError {
    fn from(error: SqsError) -> Self {
        error.into_broker_error()
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for the `sqs` service
///
/// 1. Canonical request from method, path, sorted query, signed headers and
///    payload hash
/// 2. String to sign from the timestamp, credential scope and request hash
/// 3. Signing key from the four-step HMAC chain
/// 4. `Authorization` header from the signature
#[derive(Clone)]
struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: &'static str,
}

impl SigV4Signer {
    fn new(access_key: &str, secret_key: &str, region: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
            service: "sqs",
        }
    }

    /// Produce the `Authorization` and `x-amz-date` headers for a request
    fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        canonical_query: &str,
        body: &[u8],
        timestamp: &DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(body));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.signing_key(&date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        );

        vec![("Authorization", authorization), ("x-amz-date", amz_date)]
    }

    /// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sorted, RFC 3986 encoded query string
fn canonical_query(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// Response Parsing
// ============================================================================

/// A message as returned by `ReceiveMessage`, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
struct SqsMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
}

/// Text of the first element named `tag`
fn parse_single_value(xml: &str, tag: &[u8]) -> Result<String, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == tag => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e
                    .unescape()
                    .map(|s| s.into_owned())
                    .map_err(|e| SqsError::Serialization(format!("Failed to parse XML: {}", e)));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SqsError::Serialization(format!("XML parsing error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Err(SqsError::Serialization(format!(
        "{} not found in response",
        String::from_utf8_lossy(tag)
    )))
}

fn parse_receive_response(xml: &str) -> Result<Vec<SqsMessage>, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut message_id = String::new();
    let mut receipt_handle = String::new();
    let mut body = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"Message" {
                    message_id.clear();
                    receipt_handle.clear();
                    body.clear();
                }
                path.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Text(e)) => {
                // Only direct children of <Message>; attribute values are ignored.
                let parent = path.len().checked_sub(2).map(|i| path[i].as_slice());
                if parent == Some(b"Message".as_slice()) {
                    let text = e.unescape().map_err(|e| {
                        SqsError::Serialization(format!("Failed to parse XML: {}", e))
                    })?;
                    match path.last().map(Vec::as_slice) {
                        Some(b"MessageId") => message_id.push_str(&text),
                        Some(b"ReceiptHandle") => receipt_handle.push_str(&text),
                        Some(b"Body") => body.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                path.pop();
                if e.name().as_ref() == b"Message" && !receipt_handle.is_empty() {
                    messages.push(SqsMessage {
                        message_id: std::mem::take(&mut message_id),
                        receipt_handle: std::mem::take(&mut receipt_handle),
                        body: std::mem::take(&mut body),
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SqsError::Serialization(format!("XML parsing error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let code = parse_single_value(xml, b"Code").unwrap_or_else(|_| "Unknown".to_string());
    let message = parse_single_value(xml, b"Message").unwrap_or_else(|_| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::Service { code, message },
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// AWS SQS implementation of [`MessageBroker`]
pub struct SqsBroker {
    http_client: HttpClient,
    signer: SigV4Signer,
    config: SqsConfig,
    endpoint: url::Url,
    queue_url: String,
}

impl SqsBroker {
    /// Bind to the configured queue
    ///
    /// Resolves the queue URL up front, so a missing queue or bad credentials
    /// fail here rather than on the first receive.
    pub async fn connect(config: SqsConfig) -> Result<Self, BrokerError> {
        for (key, value) in [
            ("sqs.queue_name", &config.queue_name),
            ("sqs.access_key_id", &config.access_key_id),
            ("sqs.secret_access_key", &config.secret_access_key),
            ("sqs.region", &config.region),
        ] {
            if value.is_empty() {
                return Err(ConfigurationError::Missing {
                    key: key.to_string(),
                }
                .into());
            }
        }

        let endpoint = url::Url::parse(&config.endpoint()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("Invalid SQS endpoint '{}': {}", config.endpoint(), e),
            }
        })?;

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| BrokerError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let signer = SigV4Signer::new(
            &config.access_key_id,
            &config.secret_access_key,
            &config.region,
        );

        let mut broker = Self {
            http_client,
            signer,
            config,
            endpoint,
            queue_url: String::new(),
        };
        broker.queue_url = broker.get_queue_url().await?;

        info!(
            queue = %broker.config.queue_name,
            queue_url = %broker.queue_url,
            region = %broker.config.region,
            "Bound to SQS queue"
        );

        Ok(broker)
    }

    async fn get_queue_url(&self) -> Result<String, SqsError> {
        let mut params = BTreeMap::new();
        params.insert("Action", "GetQueueUrl".to_string());
        params.insert("QueueName", self.config.queue_name.clone());

        let response = self.make_request(params).await?;
        parse_single_value(&response, b"QueueUrl")
    }

    fn is_fifo_queue(&self) -> bool {
        self.config.queue_name.ends_with(".fifo")
    }

    /// Send a signed Query API request and return the response body
    async fn make_request(&self, mut params: BTreeMap<&str, String>) -> Result<String, SqsError> {
        params.insert("Version", API_VERSION.to_string());

        let host = match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SqsError::Network(format!(
                    "SQS endpoint {} has no host",
                    self.endpoint
                )))
            }
        };

        let query = canonical_query(&params);
        let headers = self
            .signer
            .sign("POST", &host, "/", &query, b"", &Utc::now());

        let url = format!("{}://{}/?{}", self.endpoint.scheme(), host, query);
        let mut request = self.http_client.post(&url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Network(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::Network(format!("Connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        Ok(body)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), SqsError> {
        let mut params = BTreeMap::new();
        params.insert("Action", "DeleteMessage".to_string());
        params.insert("QueueUrl", self.queue_url.clone());
        params.insert("ReceiptHandle", receipt_handle.to_string());

        self.make_request(params).await.map(|_| ())
    }
}

impl fmt::Debug for SqsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsBroker")
            .field("config", &self.config)
            .field("queue_url", &self.queue_url)
            .finish()
    }
}

#[async_trait]
impl MessageBroker for SqsBroker {
    /// Receive up to three messages, deleting each before it is returned
    ///
    /// Deletion happens before the caller processes the message. If the process
    /// dies between this call and successful processing, the message is lost.
    async fn receive(&mut self) -> Result<Vec<Message>, BrokerError> {
        let mut params = BTreeMap::new();
        params.insert("Action", "ReceiveMessage".to_string());
        params.insert("QueueUrl", self.queue_url.clone());
        params.insert("MaxNumberOfMessages", MAX_MESSAGES_PER_RECEIVE.to_string());
        params.insert("WaitTimeSeconds", WAIT_TIME_SECONDS.to_string());
        params.insert("VisibilityTimeout", VISIBILITY_TIMEOUT_SECONDS.to_string());
        params.insert("MessageAttributeName.1", "Author".to_string());

        let response = self.make_request(params).await?;
        let received = parse_receive_response(&response)?;
        debug!(count = received.len(), queue = %self.config.queue_name, "Received SQS messages");

        let mut messages = Vec::with_capacity(received.len());
        for message in received {
            if let Err(e) = self.delete_message(&message.receipt_handle).await {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to delete SQS message, leaving it for redelivery"
                );
                continue;
            }

            if let Some(decoded) = decode_or_skip(BrokerKind::Sqs, message.body.as_bytes()) {
                messages.push(decoded);
            }
        }

        Ok(messages)
    }

    async fn send(&mut self, payload: &str) -> Result<(), BrokerError> {
        if let Some(max_size) = BrokerKind::Sqs.max_message_size() {
            if payload.len() > max_size {
                return Err(BrokerError::MessageTooLarge {
                    size: payload.len(),
                    max_size,
                });
            }
        }

        let mut params = BTreeMap::new();
        params.insert("Action", "SendMessage".to_string());
        params.insert("QueueUrl", self.queue_url.clone());
        params.insert("MessageBody", payload.to_string());

        if self.is_fifo_queue() {
            params.insert("MessageGroupId", self.config.message_group_id.clone());
            params.insert(
                "MessageDeduplicationId",
                hex::encode(Sha256::digest(payload.as_bytes())),
            );
        }

        let response = self.make_request(params).await?;
        let message_id = parse_single_value(&response, b"MessageId")?;
        debug!(%message_id, queue = %self.config.queue_name, "Sent SQS message");

        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Sqs
    }
}

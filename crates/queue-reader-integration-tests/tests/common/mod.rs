//! Shared fixtures for the end-to-end tests.
//!
//! RabbitMQ is replaced by the library's in-memory broker and the storage service
//! by a `wiremock` server.

#![allow(dead_code)]

use queue_reader::providers::InMemoryAmqpServer;
use queue_reader::{
    AmqpBroker, AmqpConfig, BlobResolver, HydrationError, QueueReader, VaultBlobResolver,
};
use reqwest::header::{HeaderMap, HeaderValue};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockBuilder};

pub const QUEUE: &str = "frames";

/// Resolver returning the same headers for every blob
pub struct StaticResolver {
    pub uri: String,
}

impl BlobResolver for StaticResolver {
    fn update_storage_info(&mut self, _metadata: &serde_json::Value) {}

    fn create_headers(&self, key: &str, _source: &str) -> Result<HeaderMap, HydrationError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-test-token", HeaderValue::from_static("fixed"));
        headers.insert(
            "x-kerberos-storage-filename",
            HeaderValue::from_str(key).map_err(|e| HydrationError::Resolver {
                message: e.to_string(),
            })?,
        );
        Ok(headers)
    }

    fn storage_uri(&self) -> &str {
        &self.uri
    }
}

pub fn amqp_config() -> AmqpConfig {
    AmqpConfig {
        queue_name: QUEUE.to_string(),
        target_queue_name: QUEUE.to_string(),
        host: "localhost:5672".to_string(),
        username: "guest".to_string(),
        password: "guest".to_string(),
        poll_interval_secs: 0,
        ..AmqpConfig::default()
    }
}

/// Reader over the in-memory broker with a resolver of the caller's choice
pub async fn amqp_reader(
    server: &InMemoryAmqpServer,
    resolver: Box<dyn BlobResolver>,
) -> QueueReader {
    let broker = AmqpBroker::with_connector(amqp_config(), Arc::new(server.clone()))
        .await
        .expect("in-memory broker should connect");
    QueueReader::new(Box::new(broker), resolver).expect("reader should build")
}

pub fn static_resolver(uri: &str) -> Box<dyn BlobResolver> {
    Box::new(StaticResolver {
        uri: uri.to_string(),
    })
}

pub fn vault_resolver(uri: &str) -> Box<dyn BlobResolver> {
    Box::new(VaultBlobResolver::new(uri, "AK", "SK"))
}

/// Wire body referencing blob `key` in `source`
pub fn envelope(key: &str, source: &str) -> String {
    serde_json::json!({ "payload": { "key": key }, "source": source }).to_string()
}

/// Blob endpoint request matcher for one key
pub fn blob(key: &str) -> MockBuilder {
    Mock::given(method("GET"))
        .and(path("/storage/blob"))
        .and(header("x-kerberos-storage-filename", key))
}

//! Tests for the receive-and-hydrate pipeline.
//!
//! The broker is a scripted fake and the storage service is a `wiremock` server
//! that serves a different response per `X-Kerberos-Storage-FileName`.

use super::*;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Helper Functions
// ============================================================================

#[derive(Default)]
struct BrokerState {
    batches: VecDeque<Result<Vec<Message>, BrokerError>>,
    sent: Vec<String>,
    closed: bool,
}

#[derive(Clone, Default)]
struct ScriptedBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ScriptedBroker {
    fn with_batch(messages: Vec<Message>) -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().batches.push_back(Ok(messages));
        broker
    }
}

#[async_trait]
impl MessageBroker for ScriptedBroker {
    async fn receive(&mut self) -> Result<Vec<Message>, BrokerError> {
        self.state
            .lock()
            .unwrap()
            .batches
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send(&mut self, payload: &str) -> Result<(), BrokerError> {
        self.state.lock().unwrap().sent.push(payload.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Amqp
    }
}

/// Resolver that always returns the same credentials
struct FixedResolver {
    uri: String,
}

impl BlobResolver for FixedResolver {
    fn update_storage_info(&mut self, _metadata: &serde_json::Value) {}

    fn create_headers(&self, key: &str, source: &str) -> Result<HeaderMap, HydrationError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-kerberos-storage-filename", key.parse().unwrap());
        headers.insert("x-kerberos-storage-provider", source.parse().unwrap());
        headers.insert("x-kerberos-storage-accesskey", "AK".parse().unwrap());
        Ok(headers)
    }

    fn storage_uri(&self) -> &str {
        &self.uri
    }
}

fn message(key: &str) -> Message {
    Message::decode(
        json!({ "payload": { "key": key }, "source": "s1" })
            .to_string()
            .as_bytes(),
    )
    .unwrap()
}

fn create_test_reader(broker: &ScriptedBroker, server: &MockServer) -> QueueReader {
    QueueReader::new(
        Box::new(broker.clone()),
        Box::new(FixedResolver { uri: server.uri() }),
    )
    .unwrap()
}

fn blob_mock(key: &str, response: ResponseTemplate) -> Mock {
    Mock::given(method("GET"))
        .and(path("/storage/blob"))
        .and(header("x-kerberos-storage-filename", key))
        .respond_with(response)
}

// ============================================================================
// File Mode Tests
// ============================================================================

mod file_mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_is_written_to_destination() {
        let server = MockServer::start().await;
        blob_mock("abc", ResponseTemplate::new(200).set_body_bytes(b"VIDEODATA".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        let broker = ScriptedBroker::with_batch(vec![message("abc")]);
        let mut reader = create_test_reader(&broker, &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.mp4");

        let result = reader
            .receive_and_hydrate(&HydrationMode::File(destination.clone()))
            .await;

        assert!(matches!(result, Some(Hydrated::File(ref p)) if *p == destination));
        assert_eq!(std::fs::read(&destination).unwrap(), b"VIDEODATA");
    }

    /// Verify the first fetchable message wins and later messages are untouched.
    #[tokio::test]
    async fn test_first_success_ends_the_batch() {
        let server = MockServer::start().await;
        blob_mock("a", ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        blob_mock("b", ResponseTemplate::new(200).set_body_bytes(b"B".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        blob_mock("c", ResponseTemplate::new(200).set_body_bytes(b"C".to_vec()))
            .expect(0)
            .mount(&server)
            .await;
        let broker =
            ScriptedBroker::with_batch(vec![message("a"), message("b"), message("c")]);
        let mut reader = create_test_reader(&broker, &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");

        let result = reader
            .receive_and_hydrate(&HydrationMode::File(destination.clone()))
            .await;

        assert!(matches!(result, Some(Hydrated::File(_))));
        assert_eq!(std::fs::read(&destination).unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_message_without_key_is_skipped() {
        let server = MockServer::start().await;
        blob_mock("b", ResponseTemplate::new(200).set_body_bytes(b"B".to_vec()))
            .mount(&server)
            .await;
        let keyless = Message::decode(br#"{"payload":{},"source":"s1"}"#).unwrap();
        let broker = ScriptedBroker::with_batch(vec![keyless, message("b")]);
        let mut reader = create_test_reader(&broker, &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");

        let result = reader
            .receive_and_hydrate(&HydrationMode::File(destination.clone()))
            .await;

        assert!(result.is_some());
        assert_eq!(std::fs::read(&destination).unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_not_found_leaves_no_file() {
        let server = MockServer::start().await;
        blob_mock("abc", ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let broker = ScriptedBroker::with_batch(vec![message("abc")]);
        let mut reader = create_test_reader(&broker, &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.mp4");

        let result = reader
            .receive_and_hydrate(&HydrationMode::File(destination.clone()))
            .await;

        assert!(result.is_none());
        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Verify a failed fetch does not touch an existing destination.
    #[tokio::test]
    async fn test_failure_keeps_existing_destination() {
        let server = MockServer::start().await;
        blob_mock("abc", ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let broker = ScriptedBroker::with_batch(vec![message("abc")]);
        let mut reader = create_test_reader(&broker, &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.mp4");
        std::fs::write(&destination, b"previous").unwrap();

        let result = reader
            .receive_and_hydrate(&HydrationMode::File(destination.clone()))
            .await;

        assert!(result.is_none());
        assert_eq!(std::fs::read(&destination).unwrap(), b"previous");
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_an_io_error() {
        let server = MockServer::start().await;
        blob_mock("abc", ResponseTemplate::new(200).set_body_bytes(b"X".to_vec()))
            .mount(&server)
            .await;
        let mut reader = create_test_reader(&ScriptedBroker::default(), &server);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("missing").join("out.mp4");

        let result = reader
            .hydrate(&message("abc"), &HydrationMode::File(destination.clone()))
            .await;

        assert!(matches!(result, Err(HydrationError::Io { .. })));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_slow_storage_hits_fetch_timeout() {
        let server = MockServer::start().await;
        blob_mock(
            "abc",
            ResponseTemplate::new(200)
                .set_body_bytes(b"X".to_vec())
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;
        let mut reader = create_test_reader(&ScriptedBroker::default(), &server)
            .with_fetch_timeout(Duration::from_millis(50));

        let result = reader.hydrate(&message("abc"), &HydrationMode::Raw).await;

        assert!(matches!(result, Err(HydrationError::Request(ref e)) if e.is_timeout()));
    }
}

// ============================================================================
// Raw Mode Tests
// ============================================================================

mod raw_mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_mode_returns_response() {
        let server = MockServer::start().await;
        blob_mock("abc", ResponseTemplate::new(200).set_body_bytes(b"VIDEODATA".to_vec()))
            .mount(&server)
            .await;
        let broker = ScriptedBroker::with_batch(vec![message("abc")]);
        let mut reader = create_test_reader(&broker, &server);

        let result = reader.receive_and_hydrate(&HydrationMode::Raw).await;

        let Some(Hydrated::Raw(response)) = result else {
            panic!("expected a raw response");
        };
        assert_eq!(response.status(), 200);
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"VIDEODATA");
    }
}

// ============================================================================
// Pipeline Tests
// ============================================================================

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_error_yields_none() {
        let server = MockServer::start().await;
        let broker = ScriptedBroker::default();
        broker
            .state
            .lock()
            .unwrap()
            .batches
            .push_back(Err(BrokerError::ConnectionFailed {
                message: "down".to_string(),
            }));
        let mut reader = create_test_reader(&broker, &server);

        assert!(reader.receive_and_hydrate(&HydrationMode::Raw).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_yields_none() {
        let server = MockServer::start().await;
        let mut reader = create_test_reader(&ScriptedBroker::default(), &server);

        assert!(reader.receive_and_hydrate(&HydrationMode::Raw).await.is_none());
    }

    /// Verify `data` on a message redirects the fetch to the new storage URI.
    #[tokio::test]
    async fn test_storage_metadata_updates_resolver() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/blob"))
            .and(header("x-kerberos-storage-accesskey", "fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"X".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::decode(
            json!({
                "payload": { "key": "abc" },
                "source": "s1",
                "data": { "uri": server.uri(), "access_key": "fresh" }
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        let broker = ScriptedBroker::with_batch(vec![message]);
        let resolver = VaultBlobResolver::new("http://127.0.0.1:1", "stale", "secret");
        let mut reader = QueueReader::new(Box::new(broker), Box::new(resolver)).unwrap();

        let result = reader.receive_and_hydrate(&HydrationMode::Raw).await;
        assert!(matches!(result, Some(Hydrated::Raw(_))));
    }

    #[tokio::test]
    async fn test_send_and_close_delegate_to_broker() {
        let server = MockServer::start().await;
        let broker = ScriptedBroker::default();
        let mut reader = create_test_reader(&broker, &server);

        reader.send("hello").await.unwrap();
        reader.close().await.unwrap();

        let state = broker.state.lock().unwrap();
        assert_eq!(state.sent, vec!["hello".to_string()]);
        assert!(state.closed);
        assert_eq!(reader.broker_kind(), BrokerKind::Amqp);
    }
}

//! Tests for the Kafka adapter, run against scripted client fakes.

use super::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Helper Functions
// ============================================================================

#[derive(Default)]
struct FakeState {
    records: VecDeque<Vec<u8>>,
    consumer_closed: bool,
    enqueued: Vec<(String, Vec<u8>)>,
    queue_full_attempts: usize,
    fail_delivery: bool,
    flushed: bool,
}

/// Shared handle to the state behind both fakes
#[derive(Clone, Default)]
struct FakeKafka {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKafka {
    fn push_record(&self, payload: &[u8]) {
        self.state.lock().unwrap().records.push_back(payload.to_vec());
    }

    fn clients(&self) -> (Box<dyn LogConsumer>, Box<dyn LogProducer>) {
        (Box::new(self.clone()), Box::new(self.clone()))
    }
}

#[async_trait]
impl LogConsumer for FakeKafka {
    async fn poll(&self, _timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        Ok(self.state.lock().unwrap().records.pop_front())
    }

    fn close(&self) {
        self.state.lock().unwrap().consumer_closed = true;
    }
}

#[async_trait]
impl LogProducer for FakeKafka {
    fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<PendingDelivery, EnqueueError> {
        let mut state = self.state.lock().unwrap();
        if state.queue_full_attempts > 0 {
            state.queue_full_attempts -= 1;
            return Err(EnqueueError::QueueFull);
        }

        let offset = state.enqueued.len() as i64;
        state.enqueued.push((topic.to_string(), payload.to_vec()));

        let topic = topic.to_string();
        let report = if state.fail_delivery {
            DeliveryReport::Failed {
                topic,
                reason: "broker rejected".to_string(),
            }
        } else {
            DeliveryReport::Delivered {
                topic,
                partition: 0,
                offset,
            }
        };
        Ok(Box::pin(async move { report }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.state.lock().unwrap().flushed = true;
        Ok(())
    }
}

fn create_test_config() -> KafkaConfig {
    KafkaConfig {
        topic_name: "frames".to_string(),
        broker: "localhost:9092".to_string(),
        group_id: "readers".to_string(),
        ..KafkaConfig::default()
    }
}

fn create_test_broker(fake: &FakeKafka) -> KafkaBroker {
    let (consumer, producer) = fake.clients();
    KafkaBroker::with_clients(create_test_config(), consumer, producer).unwrap()
}

// ============================================================================
// Construction Tests
// ============================================================================

mod construction_tests {
    use super::*;

    #[test]
    fn test_construction_requires_group_id() {
        let config = KafkaConfig {
            group_id: String::new(),
            ..create_test_config()
        };
        let (consumer, producer) = FakeKafka::default().clients();

        let result = KafkaBroker::with_clients(config, consumer, producer);
        assert!(matches!(
            result,
            Err(BrokerError::ConfigurationError(ConfigurationError::Missing { key }))
                if key == "kafka.group_id"
        ));
    }

    #[test]
    fn test_delivery_reports_can_be_taken_once() {
        let mut broker = create_test_broker(&FakeKafka::default());

        assert!(broker.take_delivery_reports().is_some());
        assert!(broker.take_delivery_reports().is_none());
        assert_eq!(broker.kind(), BrokerKind::Kafka);
    }
}

// ============================================================================
// Receive Tests
// ============================================================================

mod receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_timeout_returns_nothing() {
        let mut broker = create_test_broker(&FakeKafka::default());

        let messages = broker.receive().await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_receive_decodes_one_record() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);
        fake.push_record(br#"{"payload":{"key":"a"},"source":"s1"}"#);

        let messages = broker.receive().await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].blob_reference().unwrap().key, "a");
    }

    #[tokio::test]
    async fn test_receive_skips_tombstone() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);
        fake.push_record(b"");

        assert!(broker.receive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_skips_malformed_record() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);
        fake.push_record(b"[1, 2, 3]");

        assert!(broker.receive().await.unwrap().is_empty());
    }
}

// ============================================================================
// Send Tests
// ============================================================================

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_targets_configured_topic_and_reports_delivery() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);
        let mut reports = broker.take_delivery_reports().unwrap();

        broker.send(r#"{"done":true}"#).await.unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(
            report,
            DeliveryReport::Delivered {
                topic: "kcloud-analysis-queue".to_string(),
                partition: 0,
                offset: 0,
            }
        );
        let enqueued = fake.state.lock().unwrap().enqueued.clone();
        assert_eq!(
            enqueued,
            vec![(
                "kcloud-analysis-queue".to_string(),
                br#"{"done":true}"#.to_vec()
            )]
        );
    }

    #[tokio::test]
    async fn test_send_reports_failed_delivery() {
        let fake = FakeKafka::default();
        fake.state.lock().unwrap().fail_delivery = true;
        let mut broker = create_test_broker(&fake);
        let mut reports = broker.take_delivery_reports().unwrap();

        broker.send("hello").await.unwrap();

        assert!(matches!(
            reports.recv().await.unwrap(),
            DeliveryReport::Failed { ref reason, .. } if reason == "broker rejected"
        ));
    }

    /// Verify one queue-full rejection is absorbed by waiting and retrying.
    #[tokio::test(start_paused = true)]
    async fn test_send_retries_once_when_queue_full() {
        let fake = FakeKafka::default();
        fake.state.lock().unwrap().queue_full_attempts = 1;
        let mut broker = create_test_broker(&fake);
        let mut reports = broker.take_delivery_reports().unwrap();

        let started = tokio::time::Instant::now();
        broker.send("hello").await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(matches!(
            reports.recv().await.unwrap(),
            DeliveryReport::Delivered { .. }
        ));
    }

    /// Verify a queue that stays full drops the payload without an error.
    #[tokio::test(start_paused = true)]
    async fn test_send_drops_payload_when_queue_stays_full() {
        let fake = FakeKafka::default();
        fake.state.lock().unwrap().queue_full_attempts = 2;
        let mut broker = create_test_broker(&fake);
        let mut reports = broker.take_delivery_reports().unwrap();

        broker.send("hello").await.unwrap();

        assert!(fake.state.lock().unwrap().enqueued.is_empty());
        assert!(matches!(
            reports.recv().await.unwrap(),
            DeliveryReport::Failed { ref reason, .. } if reason == "producer queue full"
        ));
    }

    /// Verify sends made before anyone takes the receiver are not buffered.
    #[tokio::test]
    async fn test_reports_before_take_are_not_buffered() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);

        for _ in 0..1000 {
            broker.send("hello").await.unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut reports = broker.take_delivery_reports().unwrap();
        assert!(matches!(
            reports.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        broker.send("after").await.unwrap();
        assert_eq!(
            reports.recv().await.unwrap(),
            DeliveryReport::Delivered {
                topic: "kcloud-analysis-queue".to_string(),
                partition: 0,
                offset: 1000,
            }
        );
    }

    /// Verify a dropped payload is still accepted when nobody listens for reports.
    #[tokio::test(start_paused = true)]
    async fn test_dropped_payload_without_report_receiver() {
        let fake = FakeKafka::default();
        fake.state.lock().unwrap().queue_full_attempts = 2;
        let mut broker = create_test_broker(&fake);

        assert!(broker.send("hello").await.is_ok());
        assert!(fake.state.lock().unwrap().enqueued.is_empty());
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_payload() {
        let mut broker = create_test_broker(&FakeKafka::default());

        let result = broker.send(&"x".repeat(1024 * 1024 + 1)).await;
        assert!(matches!(result, Err(BrokerError::MessageTooLarge { .. })));
    }
}

// ============================================================================
// Close Tests
// ============================================================================

mod close_tests {
    use super::*;

    #[tokio::test]
    async fn test_close_flushes_and_rejects_later_calls() {
        let fake = FakeKafka::default();
        let mut broker = create_test_broker(&fake);

        broker.close().await.unwrap();

        {
            let state = fake.state.lock().unwrap();
            assert!(state.consumer_closed);
            assert!(state.flushed);
        }
        assert!(matches!(
            broker.receive().await,
            Err(BrokerError::Closed {
                broker: BrokerKind::Kafka
            })
        ));
        assert!(matches!(
            broker.send("late").await,
            Err(BrokerError::Closed { .. })
        ));
        // A second close has nothing left to release.
        assert!(broker.close().await.is_ok());
    }
}

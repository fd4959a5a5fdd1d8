//! Integration tests for the relay lifecycle
//!
//! Drive the full start -> deliver -> shutdown cycle against the in-memory
//! broker and store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::sync::{oneshot, watch};

use staterelay_core::{
    BackendError, Consumer, ConsumerError, InMemoryConsumer, InMemoryStateBackend, Relay, RelayConfig,
    RelayMetrics, RelayStatus, RoutingKeyParser, ShutdownError, StartupError, StateBackend,
    StateStore, StorageKey, Subscription,
};

const ALICE_ON_OFF: &str = "alice.$cloud.device.b6b984190f.channel.on-off.event.state";

fn test_config(workers: usize) -> RelayConfig {
    RelayConfig::new(workers).with_hostname("test")
}

fn metrics() -> RelayMetrics {
    RelayMetrics::new(&Registry::new()).unwrap()
}

fn store(backend: Arc<dyn StateBackend>) -> StateStore {
    StateStore::new(RoutingKeyParser::new().unwrap(), backend)
}

/// Backend that delays writes by an amount chosen per payload
struct DelayedBackend {
    inner: InMemoryStateBackend,
    delay_for: fn(&[u8]) -> Duration,
}

#[async_trait]
impl StateBackend for DelayedBackend {
    async fn set(&self, key: &StorageKey, body: &[u8]) -> Result<(), BackendError> {
        tokio::time::sleep((self.delay_for)(body)).await;
        self.inner.set(key, body).await
    }
}

/// Backend whose writes always fail
struct UnavailableBackend;

#[async_trait]
impl StateBackend for UnavailableBackend {
    async fn set(&self, _key: &StorageKey, _body: &[u8]) -> Result<(), BackendError> {
        Err(BackendError::Connection("connection refused".into()))
    }
}

/// Consumer that records the relay status seen at each subscribe
struct StatusObservingConsumer {
    inner: InMemoryConsumer,
    status: watch::Receiver<RelayStatus>,
    seen: Mutex<Vec<RelayStatus>>,
}

#[async_trait]
impl Consumer for StatusObservingConsumer {
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, ConsumerError> {
        self.seen.lock().push(*self.status.borrow());
        self.inner.subscribe(consumer_tag).await
    }
}

#[tokio::test]
async fn test_end_to_end_save_and_ack() {
    let consumer = InMemoryConsumer::new();
    let backend = Arc::new(InMemoryStateBackend::new());
    let metrics = metrics();

    let relay = Relay::start(
        test_config(2),
        &consumer,
        store(backend.clone()),
        metrics.clone(),
    )
    .await
    .unwrap();

    assert_eq!(relay.status(), RelayStatus::Running);
    assert_eq!(relay.worker_count(), 2);
    assert_eq!(
        consumer.consumer_tags(),
        vec![
            "stateservice-consumer-test-0".to_string(),
            "stateservice-consumer-test-1".to_string(),
        ]
    );

    let good = consumer.publish(ALICE_ON_OFF, b"ON").unwrap();
    let bad = consumer.publish("bad.key.format", b"OFF").unwrap();

    let report = relay.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(report.processed(), 2);
    assert_eq!(
        backend.writes(),
        vec![("state:alice:b6b984190f:on-off".to_string(), b"ON".to_vec())]
    );
    assert_eq!(consumer.ack_count(good), 1);
    assert_eq!(consumer.ack_count(bad), 1);
    assert_eq!(metrics.processed_count(), 2);
    assert_eq!(metrics.processing_time_samples(), 2);
}

#[tokio::test]
async fn test_store_failures_are_still_acknowledged() {
    let consumer = InMemoryConsumer::new();
    let relay = Relay::start(
        test_config(1),
        &consumer,
        store(Arc::new(UnavailableBackend)),
        metrics(),
    )
    .await
    .unwrap();

    let tags: Vec<u64> = (0..5)
        .map(|i| consumer.publish(ALICE_ON_OFF, format!("{i}").as_bytes()).unwrap())
        .collect();

    let report = relay.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(report.drained[0].processed, 5);
    assert_eq!(report.drained[0].failed, 5);
    for tag in tags {
        assert_eq!(consumer.ack_count(tag), 1);
    }
}

#[tokio::test]
async fn test_every_delivery_acknowledged_exactly_once() {
    let consumer = InMemoryConsumer::new();
    let backend = Arc::new(InMemoryStateBackend::new());
    let relay = Relay::start(test_config(4), &consumer, store(backend.clone()), metrics())
        .await
        .unwrap();

    let mut tags = Vec::new();
    for i in 0..100 {
        let routing_key = if i % 10 == 0 {
            "nobody.device.x".to_string()
        } else {
            format!("user{}.$cloud.device.dev{}.channel.power.event.state", i % 3, i)
        };
        tags.push(consumer.publish(&routing_key, b"payload").unwrap());
    }

    let report = relay.shutdown().await;

    assert_eq!(report.processed(), 100);
    assert_eq!(consumer.total_acks(), 100);
    assert!(tags.iter().all(|tag| consumer.ack_count(*tag) == 1));
    assert_eq!(backend.write_count(), 90);
}

#[tokio::test(start_paused = true)]
async fn test_last_completed_write_wins_across_workers() {
    let consumer = InMemoryConsumer::new();
    let backend = Arc::new(DelayedBackend {
        inner: InMemoryStateBackend::new(),
        delay_for: |body| {
            if body == b"B" {
                Duration::from_millis(50)
            } else {
                Duration::ZERO
            }
        },
    });

    let relay = Relay::start(test_config(2), &consumer, store(backend.clone()), metrics())
        .await
        .unwrap();

    // B is published first but its save completes last
    consumer.publish_to(1, ALICE_ON_OFF, b"B").unwrap();
    consumer.publish_to(0, ALICE_ON_OFF, b"A").unwrap();

    let report = relay.shutdown().await;

    assert!(report.is_clean());
    let writes = backend.inner.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].1, b"B".to_vec());
    assert_eq!(
        backend.inner.get("state:alice:b6b984190f:on-off"),
        Some(b"B".to_vec())
    );
}

#[tokio::test]
async fn test_startup_failure_is_fatal_and_releases_started_workers() {
    let consumer = InMemoryConsumer::with_subscribe_limit(2);

    let result = Relay::start(
        test_config(3),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
    )
    .await;

    match result {
        Err(StartupError::Bind { index, source }) => {
            assert_eq!(index, 2);
            assert!(matches!(source, ConsumerError::Subscribe { .. }));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("startup should have failed"),
    }

    assert!(!consumer.is_open(0));
    assert!(!consumer.is_open(1));
    assert_eq!(
        consumer.closed(),
        vec![
            "stateservice-consumer-test-0".to_string(),
            "stateservice-consumer-test-1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_zero_workers_rejected() {
    let consumer = InMemoryConsumer::new();

    let result = Relay::start(
        test_config(0),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
    )
    .await;

    assert!(matches!(result, Err(StartupError::NoWorkers)));
    assert_eq!(consumer.subscription_count(), 0);
}

#[tokio::test]
async fn test_shutdown_error_does_not_stop_remaining_workers() {
    let consumer = InMemoryConsumer::with_failing_cancels(vec![0]);
    let relay = Relay::start(
        test_config(3),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
    )
    .await
    .unwrap();
    let status = relay.subscribe_status();

    let report = relay.shutdown().await;

    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 0);
    assert!(matches!(
        report.failed[0].1,
        ShutdownError::Consumer(ConsumerError::Cancel { .. })
    ));
    let drained: Vec<usize> = report.drained.iter().map(|s| s.index).collect();
    assert_eq!(drained, vec![1, 2]);
    assert_eq!(*status.borrow(), RelayStatus::Stopped);
}

#[tokio::test]
async fn test_workers_shut_down_in_index_order() {
    let consumer = InMemoryConsumer::new();
    let relay = Relay::start(
        test_config(3),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
    )
    .await
    .unwrap();

    relay.shutdown().await;

    assert_eq!(consumer.closed(), consumer.consumer_tags());
}

#[tokio::test]
async fn test_no_intake_after_shutdown() {
    let consumer = InMemoryConsumer::new();
    let backend = Arc::new(InMemoryStateBackend::new());
    let relay = Relay::start(test_config(2), &consumer, store(backend.clone()), metrics())
        .await
        .unwrap();

    relay.shutdown().await;

    assert!(consumer.publish(ALICE_ON_OFF, b"late").is_none());
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_run_until_signal() {
    let consumer = InMemoryConsumer::new();
    let backend = Arc::new(InMemoryStateBackend::new());
    let relay = Relay::start(test_config(2), &consumer, store(backend.clone()), metrics())
        .await
        .unwrap();
    let mut status = relay.subscribe_status();

    let (signal_tx, signal_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(relay.run_until(async {
        let _ = signal_rx.await;
    }));

    consumer.publish(ALICE_ON_OFF, b"ON").unwrap();
    assert_eq!(*status.borrow_and_update(), RelayStatus::Running);

    signal_tx.send(()).unwrap();
    let report = running.await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.processed(), 1);
    assert_eq!(*status.borrow(), RelayStatus::Stopped);
    assert_eq!(
        backend.get("state:alice:b6b984190f:on-off"),
        Some(b"ON".to_vec())
    );
}

#[tokio::test]
async fn test_status_is_starting_while_workers_bind() {
    let (status_tx, status_rx) = watch::channel(RelayStatus::Stopped);
    let consumer = StatusObservingConsumer {
        inner: InMemoryConsumer::new(),
        status: status_rx.clone(),
        seen: Mutex::new(Vec::new()),
    };

    let relay = Relay::start_with_status(
        test_config(3),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
        status_tx,
    )
    .await
    .unwrap();

    assert_eq!(*consumer.seen.lock(), vec![RelayStatus::Starting; 3]);
    assert_eq!(*status_rx.borrow(), RelayStatus::Running);

    relay.shutdown().await;
    assert_eq!(*status_rx.borrow(), RelayStatus::Stopped);
}

#[tokio::test]
async fn test_failed_startup_reports_stopped() {
    let (status_tx, status_rx) = watch::channel(RelayStatus::Starting);
    let consumer = InMemoryConsumer::with_subscribe_limit(1);

    let result = Relay::start_with_status(
        test_config(2),
        &consumer,
        store(Arc::new(InMemoryStateBackend::new())),
        metrics(),
        status_tx,
    )
    .await;

    assert!(matches!(result, Err(StartupError::Bind { index: 1, .. })));
    assert_eq!(*status_rx.borrow(), RelayStatus::Stopped);
}

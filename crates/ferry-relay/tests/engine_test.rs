//! Engine lifecycle: spawned workers, shutdown, and drop behaviour.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ferry_core::{EventStatus, RealClock};
use ferry_relay::{
    events::mock::RecordingEventHandler, sink::mock::RecordingSink,
    storage::mock::MockRelayStorage, RelayConfig, RelayEngine, RelayError,
};
use ferry_testing::fixtures::{customer_created_payload, malformed_payload, CUSTOMER_TOPIC};

fn config(worker_count: usize) -> RelayConfig {
    RelayConfig {
        worker_count,
        batch_size: 25,
        poll_interval: Duration::from_millis(5),
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn engine(
    storage: &MockRelayStorage,
    sink: &Arc<RecordingSink>,
    worker_count: usize,
) -> (RelayEngine, Arc<RecordingEventHandler>) {
    let handler = Arc::new(RecordingEventHandler::new());
    let engine = RelayEngine::with_event_handler(
        Arc::new(storage.clone()),
        sink.clone(),
        config(worker_count),
        Arc::new(RealClock::new()),
        handler.clone(),
    )
    .unwrap();
    (engine, handler)
}

async fn wait_until_drained(storage: &MockRelayStorage) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while storage.count_by_status(EventStatus::Pending) > 0 {
        assert!(Instant::now() < deadline, "relay did not drain the outbox in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_drain_outbox_and_shut_down() -> anyhow::Result<()> {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    let ids: Vec<_> = (1..=200)
        .map(|n| storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(n)))
        .collect();
    let (mut engine, handler) = engine(&storage, &sink, 2);

    engine.start().await?;
    assert!(engine.is_running());
    wait_until_drained(&storage).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.stats().await.events_published < 200 {
        assert!(Instant::now() < deadline, "stats never caught up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = engine.stats().await;
    assert_eq!(stats.active_workers, 2);
    assert_eq!(stats.events_published, 200);

    engine.shutdown().await?;

    assert!(sink.is_closed());
    assert_eq!(sink.append_count(), 200);
    assert_eq!(handler.events().len(), 200);
    for id in ids {
        assert_eq!(storage.claim_count(id), 1);
    }
    Ok(())
}

#[tokio::test]
async fn poison_and_good_events_settle_through_engine() {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    storage.insert_pending(CUSTOMER_TOPIC, &malformed_payload());
    storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    let (engine, handler) = engine(&storage, &sink, 1);

    let report = engine.run_cycle().await.unwrap();

    assert_eq!(report.poisoned, 1);
    assert_eq!(report.published, 1);
    assert_eq!(handler.poisoned_count(), 1);
    assert_eq!(engine.stats().await.events_poisoned, 1);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn shutdown_without_start_closes_sink() {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    let (engine, _handler) = engine(&storage, &sink, 1);
    let token = engine.cancellation_token();

    engine.shutdown().await.unwrap();

    assert!(sink.is_closed());
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, _handler) = engine(&storage, &sink, 1);

    engine.start().await.unwrap();
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, RelayError::ConfigurationError { .. }));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropping_started_engine_cancels_workers() {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, _handler) = engine(&storage, &sink, 2);
    let token = engine.cancellation_token();

    engine.start().await.unwrap();
    drop(engine);

    assert!(token.is_cancelled());
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let result = RelayEngine::with_event_handler(
        Arc::new(MockRelayStorage::new()),
        Arc::new(RecordingSink::new()),
        RelayConfig { batch_size: 0, ..RelayConfig::default() },
        Arc::new(RealClock::new()),
        Arc::new(RecordingEventHandler::new()),
    );

    assert!(matches!(result, Err(RelayError::ConfigurationError { .. })));
}

#[tokio::test]
async fn outage_keeps_events_pending_until_sink_recovers() {
    let storage = MockRelayStorage::new();
    let sink = Arc::new(RecordingSink::new());
    let id = storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    sink.set_failing(true);
    let (mut engine, _handler) = engine(&storage, &sink, 1);

    engine.start().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while storage.event(id).unwrap().retry_count < 2 {
        assert!(Instant::now() < deadline, "no retries recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(storage.event(id).unwrap().status, EventStatus::Pending);

    sink.set_failing(false);
    wait_until_drained(&storage).await;
    engine.shutdown().await.unwrap();

    let event = storage.event(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert!(event.retry_count >= 2);
    assert_eq!(sink.append_count(), 1);
}

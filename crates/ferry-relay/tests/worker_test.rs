//! Relay cycle behaviour against in-memory storage and a recording sink.
//!
//! Covers the delivery scenarios end to end without infrastructure: golden
//! path, destination outage and recovery, poison messages, concurrent
//! pollers, and every way a cycle can be abandoned.

use std::{sync::Arc, time::Duration};

use ferry_core::{EventStatus, TestClock};
use ferry_relay::{
    events::mock::RecordingEventHandler,
    sink::{mock::RecordingSink, StreamSink},
    storage::{mock::MockRelayStorage, RelayStorage},
    EngineStats, RelayConfig, RelayError, RelayEvent, RelayWorker,
};
use ferry_testing::fixtures::{customer_created_payload, malformed_payload, CUSTOMER_TOPIC};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct Harness {
    storage: MockRelayStorage,
    sink: Arc<RecordingSink>,
    handler: Arc<RecordingEventHandler>,
    stats: Arc<RwLock<EngineStats>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            storage: MockRelayStorage::new(),
            sink: Arc::new(RecordingSink::new()),
            handler: Arc::new(RecordingEventHandler::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
        }
    }

    fn worker(&self, id: usize, batch_size: usize) -> RelayWorker {
        RelayWorker::new(
            id,
            Arc::new(self.storage.clone()),
            self.sink.clone(),
            RelayConfig { batch_size, ..RelayConfig::default() },
            self.stats.clone(),
            CancellationToken::new(),
            self.handler.clone(),
            Arc::new(TestClock::new()),
        )
    }

    fn insert_customers(&self, count: i64) -> Vec<ferry_core::EventId> {
        (1..=count)
            .map(|id| self.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(id)))
            .collect()
    }
}

#[tokio::test]
async fn golden_path_publishes_exact_payload() {
    let harness = Harness::new();
    let payload = customer_created_payload(1);
    let id = harness.storage.insert_pending(CUSTOMER_TOPIC, &payload);

    let report = harness.worker(0, 100).run_cycle().await.unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.published, 1);

    let appends = harness.sink.appends();
    assert_eq!(appends.len(), 1);
    assert_eq!(appends[0].topic, CUSTOMER_TOPIC);
    assert_eq!(appends[0].payload.as_ref(), payload.as_slice());

    let event = harness.storage.event(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert!(event.published_at.is_some());
    assert_eq!(event.retry_count, 0);
}

#[tokio::test]
async fn batch_is_processed_oldest_first() {
    let harness = Harness::new();
    harness.insert_customers(5);

    harness.worker(0, 100).run_cycle().await.unwrap();

    let expected: Vec<Vec<u8>> = (1..=5).map(customer_created_payload).collect();
    let delivered: Vec<Vec<u8>> =
        harness.sink.appends().iter().map(|a| a.payload.to_vec()).collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn destination_outage_then_recovery() {
    let harness = Harness::new();
    let id = harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    let worker = harness.worker(0, 100);

    harness.sink.set_failing(true);
    for expected_retries in 1..=3 {
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.retried, 1);

        let event = harness.storage.event(id).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, expected_retries);
        assert!(event.published_at.is_none());
    }

    harness.sink.set_failing(false);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);

    let event = harness.storage.event(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert_eq!(event.retry_count, 3);
    assert_eq!(harness.sink.append_count(), 1);
    assert_eq!(harness.sink.attempt_count(), 4);
}

#[tokio::test]
async fn malformed_payload_is_poisoned_without_delivery() {
    let harness = Harness::new();
    let bad = harness.storage.insert_pending(CUSTOMER_TOPIC, &malformed_payload());

    let report = harness.worker(0, 100).run_cycle().await.unwrap();

    assert_eq!(report.poisoned, 1);
    assert_eq!(harness.sink.attempt_count(), 0);

    let event = harness.storage.event(bad).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert_eq!(event.retry_count, 0);

    // Never claimed again.
    let report = harness.worker(0, 100).run_cycle().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(harness.storage.claim_count(bad), 1);
}

#[tokio::test]
async fn well_formed_json_outside_the_envelope_shape_is_delivered() {
    let harness = Harness::new();
    let payloads: [&[u8]; 4] = [
        br#"{"type":"customer.created","occurredAt":"2024-01-01 10:00:00"}"#,
        br#"{"type":"customer.created","recordId":1.0}"#,
        br#"{"event":"customer.created","id":1}"#,
        br#"{"type":"customer.created","version":"2"}"#,
    ];
    let ids: Vec<_> =
        payloads.iter().map(|p| harness.storage.insert_pending(CUSTOMER_TOPIC, p)).collect();

    let report = harness.worker(0, 100).run_cycle().await.unwrap();

    assert_eq!(report.claimed, 4);
    assert_eq!(report.published, 4);
    assert_eq!(report.poisoned, 0);
    let delivered: Vec<_> = harness.sink.appends().into_iter().map(|a| a.payload).collect();
    let expected: Vec<_> = payloads.iter().map(|p| bytes::Bytes::copy_from_slice(p)).collect();
    assert_eq!(delivered, expected);
    for id in ids {
        assert_eq!(harness.storage.event(id).unwrap().status, EventStatus::Published);
    }
    assert_eq!(harness.handler.poisoned_count(), 0);
}

#[tokio::test]
async fn closed_sink_leaves_batch_untouched() {
    let harness = Harness::new();
    let ids = harness.insert_customers(2);
    harness.sink.close().await;

    let err = harness.worker(0, 100).run_cycle().await.unwrap_err();

    assert!(!err.is_retryable());
    for id in &ids {
        let event = harness.storage.event(*id).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }
    assert_eq!(harness.storage.locked_count(), 0);
    assert_eq!(harness.stats.read().await.abandoned_cycles, 1);
}

#[tokio::test]
async fn poison_does_not_block_later_events() {
    let harness = Harness::new();
    let first = harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    let bad = harness.storage.insert_pending(CUSTOMER_TOPIC, &malformed_payload());
    let empty = harness.storage.insert_pending(CUSTOMER_TOPIC, b"");
    let last = harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(2));

    let report = harness.worker(0, 100).run_cycle().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(report.poisoned, 2);
    assert_eq!(harness.sink.append_count(), 2);
    for id in [first, bad, empty, last] {
        assert_eq!(harness.storage.event(id).unwrap().status, EventStatus::Published);
    }
    assert_eq!(harness.handler.poisoned_count(), 2);
}

#[tokio::test]
async fn one_cycle_claims_at_most_batch_size() {
    let harness = Harness::new();
    harness.insert_customers(250);

    let report = harness.worker(0, 100).run_cycle().await.unwrap();

    assert_eq!(report.claimed, 100);
    assert_eq!(harness.storage.count_by_status(EventStatus::Published), 100);
    assert_eq!(harness.storage.count_by_status(EventStatus::Pending), 150);
}

#[tokio::test]
async fn concurrent_pollers_never_share_events() {
    let harness = Harness::new();
    let ids = harness.insert_customers(200);
    // Keeps the first claim open while the second worker claims.
    harness.sink.set_latency(Duration::from_millis(1));

    let first = harness.worker(0, 100);
    let second = harness.worker(1, 100);
    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.claimed, 100);
    assert_eq!(b.claimed, 100);
    assert_eq!(harness.storage.count_by_status(EventStatus::Published), 200);
    for id in ids {
        assert_eq!(harness.storage.claim_count(id), 1, "event {id} claimed more than once");
    }

    let mut delivered: Vec<Vec<u8>> =
        harness.sink.appends().iter().map(|a| a.payload.to_vec()).collect();
    delivered.sort();
    delivered.dedup();
    assert_eq!(delivered.len(), 200);
}

#[tokio::test]
async fn claim_error_abandons_cycle() {
    let harness = Harness::new();
    let id = harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    harness.storage.inject_claim_error("connection refused");
    let worker = harness.worker(0, 100);

    let err = worker.run_cycle().await.unwrap_err();
    assert!(matches!(err, RelayError::StorageError { .. }));
    assert_eq!(harness.sink.attempt_count(), 0);
    assert_eq!(harness.storage.event(id).unwrap().status, EventStatus::Pending);

    let stats = harness.stats.read().await.clone();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.abandoned_cycles, 1);

    // Next tick recovers.
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn update_error_rolls_back_whole_batch() {
    let harness = Harness::new();
    let ids = harness.insert_customers(3);
    harness.storage.inject_update_error("deadlock detected");
    let worker = harness.worker(0, 100);

    let err = worker.run_cycle().await.unwrap_err();
    assert!(err.is_retryable());
    for id in &ids {
        let event = harness.storage.event(*id).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }
    assert_eq!(harness.storage.locked_count(), 0);
    assert!(harness.handler.events().is_empty());

    // The first event reached the stream before the failure and is delivered
    // again on the next cycle.
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.published, 3);
    assert_eq!(harness.sink.append_count(), 4);
}

#[tokio::test]
async fn commit_error_leaves_events_pending() {
    let harness = Harness::new();
    let id = harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    harness.storage.inject_commit_error("server closed the connection");

    let err = harness.worker(0, 100).run_cycle().await.unwrap_err();

    assert!(matches!(err, RelayError::StorageError { .. }));
    assert_eq!(harness.storage.event(id).unwrap().status, EventStatus::Pending);
    assert_eq!(harness.storage.locked_count(), 0);
    assert!(harness.handler.events().is_empty());
}

#[tokio::test]
async fn crash_before_commit_leaves_events_reclaimable() {
    let harness = Harness::new();
    let ids = harness.insert_customers(2);
    harness.sink.set_latency(Duration::from_secs(60));
    let worker = harness.worker(0, 100);

    // Worker task dies mid-delivery.
    let aborted = tokio::time::timeout(Duration::from_millis(20), worker.run_cycle()).await;
    assert!(aborted.is_err());

    assert_eq!(harness.storage.locked_count(), 0);
    for id in &ids {
        assert_eq!(harness.storage.event(*id).unwrap().status, EventStatus::Pending);
    }

    harness.sink.set_latency(Duration::ZERO);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.published, 2);
}

#[tokio::test]
async fn dropped_claim_releases_locks_and_discards_changes() {
    let storage = MockRelayStorage::new();
    let id = storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));

    let mut claim = storage.claim_batch(10).await.unwrap();
    claim.transaction.mark_published(id, chrono::Utc::now()).await.unwrap();
    assert_eq!(storage.locked_count(), 1);

    // Locked rows are invisible to other claimants.
    let other = storage.claim_batch(10).await.unwrap();
    assert!(other.events.is_empty());
    drop(other);

    drop(claim);
    assert_eq!(storage.locked_count(), 0);
    assert_eq!(storage.event(id).unwrap().status, EventStatus::Pending);
}

#[tokio::test]
async fn outcome_events_follow_commit() {
    let harness = Harness::new();
    harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    harness.storage.insert_pending(CUSTOMER_TOPIC, &malformed_payload());

    harness.worker(3, 100).run_cycle().await.unwrap();

    let events = harness.handler.events();
    assert_eq!(events.len(), 2);
    match &events[0] {
        RelayEvent::Published(published) => {
            assert_eq!(published.worker_id, 3);
            assert_eq!(published.stream_entry_id.as_deref(), Some("1-0"));
        },
        other => panic!("expected published event, got {other:?}"),
    }
    assert!(matches!(events[1], RelayEvent::Poisoned(_)));

    let stats = harness.stats.read().await.clone();
    assert_eq!(stats.events_claimed, 2);
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.events_poisoned, 1);
}

#[tokio::test]
async fn retried_event_reports_new_retry_count() {
    let harness = Harness::new();
    harness.storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
    harness.sink.set_failing(true);
    let worker = harness.worker(0, 100);

    worker.run_cycle().await.unwrap();
    worker.run_cycle().await.unwrap();

    let retry_counts: Vec<i32> = harness
        .handler
        .events()
        .iter()
        .filter_map(|e| match e {
            RelayEvent::Retried(r) => Some(r.retry_count),
            _ => None,
        })
        .collect();
    assert_eq!(retry_counts, vec![1, 2]);
    assert_eq!(harness.stats.read().await.events_retried, 2);
}

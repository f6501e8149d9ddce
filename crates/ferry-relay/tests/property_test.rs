//! Property-based tests for status transitions and retry accounting.

use std::sync::Arc;

use ferry_core::{EventStatus, TestClock};
use ferry_relay::{
    events::NoOpEventHandler,
    sink::mock::RecordingSink,
    storage::mock::MockRelayStorage,
    tracker::{self, Input, Transition},
    EngineStats, RelayConfig, RelayWorker,
};
use ferry_testing::fixtures::{customer_created_payload, malformed_payload, CUSTOMER_TOPIC};
use proptest::prelude::*;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

fn input_strategy() -> impl Strategy<Value = Input> {
    prop_oneof![
        Just(Input::DeliverySucceeded),
        Just(Input::DeliveryFailed),
        Just(Input::PayloadUnparsable),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #[test]
    fn retry_count_is_monotonic_and_counts_only_failures(
        start in 0i32..1_000,
        inputs in prop::collection::vec(input_strategy(), 1..20),
    ) {
        let mut status = EventStatus::Pending;
        let mut retry_count = start;
        let mut failures = 0;

        for input in inputs {
            match tracker::next(status, retry_count, input) {
                Ok(transition) => {
                    if let Transition::Retried { retry_count: next } = transition {
                        prop_assert_eq!(next, retry_count + 1);
                        retry_count = next;
                        failures += 1;
                    }
                    status = transition.status();
                },
                Err(rejected) => {
                    prop_assert_eq!(rejected.from, EventStatus::Published);
                    prop_assert!(status.is_terminal());
                },
            }
        }

        prop_assert_eq!(retry_count, start + failures);
    }

    #[test]
    fn published_is_terminal(input in input_strategy(), retry_count in 0i32..100) {
        prop_assert!(tracker::next(EventStatus::Published, retry_count, input).is_err());
    }

    #[test]
    fn relay_cycles_count_failed_deliveries(outages in prop::collection::vec(any::<bool>(), 1..12)) {
        runtime().block_on(async {
            let storage = MockRelayStorage::new();
            let sink = Arc::new(RecordingSink::new());
            let id = storage.insert_pending(CUSTOMER_TOPIC, &customer_created_payload(1));
            let worker = RelayWorker::new(
                0,
                Arc::new(storage.clone()),
                sink.clone(),
                RelayConfig::default(),
                Arc::new(RwLock::new(EngineStats::default())),
                CancellationToken::new(),
                Arc::new(NoOpEventHandler::new()),
                Arc::new(TestClock::new()),
            );

            let mut expected_retries = 0;
            let mut published = false;
            for failing in &outages {
                sink.set_failing(*failing);
                worker.run_cycle().await.unwrap();
                if !published {
                    if *failing {
                        expected_retries += 1;
                    } else {
                        published = true;
                    }
                }
            }

            let event = storage.event(id).unwrap();
            prop_assert_eq!(event.retry_count, expected_retries);
            prop_assert_eq!(event.status == EventStatus::Published, published);
            prop_assert_eq!(sink.append_count(), usize::from(published));
            Ok(())
        })?;
    }

    #[test]
    fn poison_never_reaches_the_sink(layout in prop::collection::vec(any::<bool>(), 1..40)) {
        runtime().block_on(async {
            let storage = MockRelayStorage::new();
            let sink = Arc::new(RecordingSink::new());
            for (n, malformed) in layout.iter().enumerate() {
                let payload = if *malformed {
                    malformed_payload()
                } else {
                    customer_created_payload(n as i64)
                };
                storage.insert_pending(CUSTOMER_TOPIC, &payload);
            }
            let worker = RelayWorker::new(
                0,
                Arc::new(storage.clone()),
                sink.clone(),
                RelayConfig::default(),
                Arc::new(RwLock::new(EngineStats::default())),
                CancellationToken::new(),
                Arc::new(NoOpEventHandler::new()),
                Arc::new(TestClock::new()),
            );

            let report = worker.run_cycle().await.unwrap();

            let malformed = layout.iter().filter(|m| **m).count();
            prop_assert_eq!(report.poisoned, malformed);
            prop_assert_eq!(sink.attempt_count(), layout.len() - malformed);
            prop_assert_eq!(storage.count_by_status(EventStatus::Pending), 0);
            Ok(())
        })?;
    }
}

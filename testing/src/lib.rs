//! # Courier Testing
//!
//! Testing utilities for the outbox / inbox relay.
//!
//! This crate provides:
//! - An in-memory transactional backend with skip-locked claims
//! - Broker doubles that record publishes and replay topic logs
//! - Deterministic clocks for lease arithmetic
//! - proptest strategies for message batches
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{InMemoryDatabase, InMemoryOutboxStore, RecordingPublisher, ManualClock};
//!
//! #[tokio::test]
//! async fn harvester_ships_new_rows() {
//!     let db = InMemoryDatabase::new();
//!     let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
//!     let publisher = Arc::new(RecordingPublisher::new());
//!     let harvester = OutboxHarvester::new(db, outbox, publisher.clone(), Arc::new(test_clock()), config);
//!
//!     harvester.tick().await.unwrap();
//!     assert_eq!(publisher.published_keys(), vec!["A"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

mod broker;
mod database;

pub use broker::{RecordingPublisher, ScriptedSubscriber};
pub use database::{InMemoryDatabase, InMemoryInboxStore, InMemoryOutboxStore, MemoryTx};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to a worker, then step past a lease deadline.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// The instant every test clock starts at (2025-01-01 00:00:00 UTC).
    #[must_use]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// Create a manual clock starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use courier_core::message::{MessageId, OutboxMessage};

    /// Route tracing output through the test harness writer.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// An outbox message whose payload is its own id.
    #[must_use]
    pub fn outbox_message(id: &str, event_type: &str) -> OutboxMessage {
        OutboxMessage::new(MessageId::new(id), event_type, id.as_bytes().to_vec())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use courier_core::message::{MessageId, OutboxMessage};
    use proptest::prelude::*;

    /// Strategy for batches of outbox messages with distinct ids.
    pub fn outbox_batch(max_len: usize) -> impl Strategy<Value = Vec<OutboxMessage>> {
        prop::collection::btree_set("[a-z0-9]{1,12}", 0..=max_len).prop_map(|ids| {
            ids.into_iter()
                .map(|id| OutboxMessage::new(MessageId::new(id.clone()), "topic", id.into_bytes()))
                .collect()
        })
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let clock = manual_clock();
        let handle = clock.clone();
        handle.advance(chrono::Duration::seconds(6));
        assert_eq!(clock.now(), mocks::epoch() + chrono::Duration::seconds(6));
    }
}

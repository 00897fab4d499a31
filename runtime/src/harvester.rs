//! Outbox harvester: moves committed outbox rows onto the broker.
//!
//! # Tick
//!
//! ```text
//! tx 1:  claim ≤ batch_size claimable rows, lease each until now + period
//!        (commit: the lease is visible to every other harvester)
//! ----:  publish each row, key = message id, topic = event_type
//! tx 2:  mark every row processed
//! ```
//!
//! Publishing happens outside any transaction so a slow broker never holds
//! row locks. The price is at-least-once delivery: a crash between the
//! publish and the second transaction leaves the rows leased but
//! unprocessed, and they are published again once the lease runs out.
//!
//! A publish that still fails after the retry policy aborts the tick. The
//! whole batch stays leased and is retried in full after the lease.

use crate::WorkerError;
use crate::worker::{MIN_PERIOD, ticker};
use crate::metrics::{OutboxMetrics, WorkerMetrics};
use crate::retry::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use courier_core::broker::{OutgoingRecord, Publisher};
use courier_core::environment::Clock;
use courier_core::message::OutboxMessage;
use courier_core::store::OutboxStore;
use courier_core::transaction::{Executor, Transactor, with_transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Configuration for an [`OutboxHarvester`].
///
/// # Default Values
///
/// - `period`: 5 seconds (tick interval and lease length)
/// - `batch_size`: 10
/// - `retry`: [`RetryPolicy::default`]
#[derive(Debug, Clone, PartialEq)]
pub struct HarvesterConfig {
    /// Interval between ticks; also how long a claimed batch stays leased
    pub period: Duration,
    /// Maximum rows claimed per tick
    pub batch_size: usize,
    /// Retry policy wrapped around every publish
    pub retry: RetryPolicy,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            batch_size: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl HarvesterConfig {
    /// Set the tick interval and lease length.
    #[must_use]
    pub const fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Set the maximum rows claimed per tick.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the publish retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Worker draining the outbox onto the broker.
///
/// Any number of harvesters may run against one store; the skip-locked
/// claim plus the committed lease keep their batches disjoint.
///
/// # Type Parameters
///
/// - `D`: The transactor of the store the outbox lives in
pub struct OutboxHarvester<D: Transactor + 'static> {
    db: Arc<D>,
    outbox: Arc<dyn OutboxStore<Tx = D::Tx>>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: HarvesterConfig,
    name: String,
}

impl<D: Transactor + 'static> Clone for OutboxHarvester<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            outbox: Arc::clone(&self.outbox),
            publisher: Arc::clone(&self.publisher),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            name: self.name.clone(),
        }
    }
}

impl<D: Transactor + 'static> OutboxHarvester<D> {
    /// Create a harvester.
    #[must_use]
    pub fn new(
        db: Arc<D>,
        outbox: Arc<dyn OutboxStore<Tx = D::Tx>>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        config: HarvesterConfig,
    ) -> Self {
        Self {
            db,
            outbox,
            publisher,
            clock,
            config,
            name: "outbox-harvester".to_string(),
        }
    }

    /// Set the name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The harvester's configuration.
    #[must_use]
    pub const fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Run one claim, publish, mark cycle.
    ///
    /// Returns the number of messages published and marked processed.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Store`] if either transaction fails
    /// - [`WorkerError::Broker`] if a publish fails after all retries; the
    ///   batch is left leased
    pub async fn tick(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now();
        let batch = self.claim(now).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        tracing::debug!(
            worker = %self.name,
            batch_size = batch.len(),
            "Claimed outbox batch"
        );
        OutboxMetrics::record_claimed(batch.len());

        for message in &batch {
            self.publish(message).await?;
        }

        let outbox = Arc::clone(&self.outbox);
        let ids: Vec<_> = batch.iter().map(|m| m.id.clone()).collect();
        with_transaction(&*self.db, Executor::Pool, move |tx| {
            Box::pin(async move {
                for id in &ids {
                    outbox.mark_processed(Executor::Tx(&mut *tx), id).await?;
                }
                Ok::<_, WorkerError>(())
            })
        })
        .await?;

        tracing::info!(
            worker = %self.name,
            published = batch.len(),
            "Outbox batch delivered"
        );
        Ok(batch.len())
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>, WorkerError> {
        let lease = chrono::Duration::from_std(self.config.period.max(MIN_PERIOD))
            .unwrap_or(chrono::Duration::MAX);
        let reserved_until = now
            .checked_add_signed(lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let outbox = Arc::clone(&self.outbox);
        let batch_size = self.config.batch_size;
        with_transaction(&*self.db, Executor::Pool, move |tx| {
            Box::pin(async move {
                let batch = outbox
                    .get_unprocessed(Executor::Tx(&mut *tx), batch_size, now)
                    .await?;
                for message in &batch {
                    outbox
                        .set_reserved(Executor::Tx(&mut *tx), &message.id, reserved_until)
                        .await?;
                }
                Ok::<_, WorkerError>(batch)
            })
        })
        .await
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), WorkerError> {
        let record = OutgoingRecord::new(
            message.event_type.clone(),
            message.id.as_str(),
            message.payload.clone(),
        );

        let started = Instant::now();
        match retry_with_backoff(&self.config.retry, || self.publisher.publish(&record)).await {
            Ok(()) => {
                OutboxMetrics::record_published(&record.topic, started.elapsed());
                tracing::debug!(
                    worker = %self.name,
                    message_id = %message.id,
                    topic = %record.topic,
                    "Outbox message published"
                );
                Ok(())
            },
            Err(e) => {
                OutboxMetrics::record_publish_failure(&record.topic);
                tracing::warn!(
                    worker = %self.name,
                    message_id = %message.id,
                    topic = %record.topic,
                    error = %e,
                    "Publish failed, batch stays leased"
                );
                Err(e.into())
            },
        }
    }

    /// Tick every `period` until `shutdown` turns `true`.
    ///
    /// Missed ticks are delayed, not bursted. A tick in progress when the
    /// signal arrives runs to completion first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = ticker(&self.name, self.config.period);

        tracing::info!(
            worker = %self.name,
            period_ms = self.config.period.as_millis(),
            batch_size = self.config.batch_size,
            "Outbox harvester started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        WorkerMetrics::record_tick_failure("outbox_harvester");
                        tracing::error!(
                            worker = %self.name,
                            error = %e,
                            "Outbox harvester tick failed"
                        );
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(worker = %self.name, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.name, "Outbox harvester stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use courier_testing::mocks::manual_clock;
    use courier_testing::{InMemoryDatabase, InMemoryOutboxStore, RecordingPublisher};
    use courier_testing::helpers::outbox_message;

    fn harvester(
        db: &InMemoryDatabase,
        publisher: &Arc<RecordingPublisher>,
        config: HarvesterConfig,
    ) -> OutboxHarvester<InMemoryDatabase> {
        OutboxHarvester::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryOutboxStore::new(db.clone())),
            Arc::clone(publisher) as Arc<dyn Publisher>,
            Arc::new(manual_clock()),
            config,
        )
    }

    #[test]
    fn config_defaults() {
        let config = HarvesterConfig::default();
        assert_eq!(config.period, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry, RetryPolicy::default());

        let config = config
            .with_period(Duration::from_secs(1))
            .with_batch_size(3)
            .with_retry(RetryPolicy::none());
        assert_eq!(config.period, Duration::from_secs(1));
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.retry.max_retries, 0);
    }

    #[tokio::test]
    async fn empty_outbox_publishes_nothing() {
        let db = InMemoryDatabase::new();
        let publisher = Arc::new(RecordingPublisher::new());

        let published = harvester(&db, &publisher, HarvesterConfig::default())
            .tick()
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert_eq!(publisher.attempts(), 0);
        assert_eq!(db.held_locks(), 0);
    }

    #[tokio::test]
    async fn tick_respects_batch_size() {
        let db = InMemoryDatabase::new();
        let store = InMemoryOutboxStore::new(db.clone());
        for id in ["A", "B", "C"] {
            store
                .add(Executor::Pool, &outbox_message(id, "order.payments"))
                .await
                .unwrap();
        }
        let publisher = Arc::new(RecordingPublisher::new());
        let harvester = harvester(
            &db,
            &publisher,
            HarvesterConfig::default().with_batch_size(2),
        );

        assert_eq!(harvester.tick().await.unwrap(), 2);
        assert_eq!(harvester.tick().await.unwrap(), 1);
        assert_eq!(harvester.tick().await.unwrap(), 0);

        let mut keys = publisher.published_keys();
        keys.sort();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn publish_goes_to_event_type_topic() {
        let db = InMemoryDatabase::new();
        InMemoryOutboxStore::new(db.clone())
            .add(Executor::Pool, &outbox_message("A", "payment.completed"))
            .await
            .unwrap();
        let publisher = Arc::new(RecordingPublisher::new());

        harvester(&db, &publisher, HarvesterConfig::default())
            .tick()
            .await
            .unwrap();

        let records = publisher.published();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "payment.completed");
        assert_eq!(records[0].key, "A");
    }

    #[tokio::test]
    async fn transient_publish_failure_is_retried_within_the_tick() {
        let db = InMemoryDatabase::new();
        InMemoryOutboxStore::new(db.clone())
            .add(Executor::Pool, &outbox_message("A", "order.payments"))
            .await
            .unwrap();
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.fail_next(1);
        let retry = RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(1));

        let published = harvester(&db, &publisher, HarvesterConfig::default().with_retry(retry))
            .tick()
            .await
            .unwrap();

        assert_eq!(published, 1);
        assert_eq!(publisher.attempts(), 2);
        assert!(db.outbox_row("A").unwrap().processed);
    }
}

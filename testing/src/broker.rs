//! In-memory broker doubles.
//!
//! - [`RecordingPublisher`]: captures published records, fails on demand
//! - [`ScriptedSubscriber`]: replays an append-only topic log and tracks
//!   which offsets were acknowledged, so tests can observe redelivery after
//!   a restart

use courier_core::broker::{
    BrokerError, DeliveredRecord, OutgoingRecord, Publisher, RecordStream, Subscriber,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publisher that records every accepted record.
///
/// # Example
///
/// ```
/// use courier_testing::RecordingPublisher;
/// use courier_core::broker::{OutgoingRecord, Publisher};
///
/// # async fn example() {
/// let publisher = RecordingPublisher::new();
/// publisher.fail_next(1);
///
/// let record = OutgoingRecord::new("t", "A", vec![]);
/// assert!(publisher.publish(&record).await.is_err());
/// assert!(publisher.publish(&record).await.is_ok());
/// assert_eq!(publisher.published().len(), 1);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<OutgoingRecord>>>,
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingPublisher {
    /// Create a publisher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publish attempts.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Records accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<OutgoingRecord> {
        lock(&self.published).clone()
    }

    /// Keys of the accepted records, in publish order.
    #[must_use]
    pub fn published_keys(&self) -> Vec<String> {
        lock(&self.published).iter().map(|r| r.key.clone()).collect()
    }

    /// Total publish attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(&'a self, record: &'a OutgoingRecord) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(BrokerError::PublishFailed {
                    topic: record.topic.clone(),
                    reason: "broker unreachable".to_string(),
                });
            }
            lock(&self.published).push(record.clone());
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    records: Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>,
    /// Next offset a new subscription starts from
    committed: usize,
    acked: Vec<i64>,
    closed: bool,
}

/// Subscriber over an in-memory, single-partition topic log.
///
/// Each subscription starts at the committed offset and then follows the
/// log as records are appended, until [`close`](Self::close) ends it.
/// Acknowledging a record commits its offset; records dropped
/// unacknowledged are replayed by the next subscription.
#[derive(Clone, Debug)]
pub struct ScriptedSubscriber {
    topic: String,
    log: Arc<Mutex<TopicLog>>,
    appended: Arc<Notify>,
}

impl ScriptedSubscriber {
    /// Create a subscriber on an empty topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            log: Arc::new(Mutex::new(TopicLog::default())),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Append a record to the topic.
    pub fn push(&self, key: Option<&str>, payload: Option<&[u8]>) {
        lock(&self.log)
            .records
            .push((key.map(|k| k.as_bytes().to_vec()), payload.map(<[u8]>::to_vec)));
        self.appended.notify_waiters();
    }

    /// End the topic. Open subscriptions finish once they have drained the
    /// log and new ones end right after the records still to deliver.
    pub fn close(&self) {
        lock(&self.log).closed = true;
        self.appended.notify_waiters();
    }

    /// Offsets acknowledged so far, in acknowledgement order.
    #[must_use]
    pub fn acked_offsets(&self) -> Vec<i64> {
        lock(&self.log).acked.clone()
    }

    /// Offset the next subscription starts from.
    #[must_use]
    pub fn committed_offset(&self) -> usize {
        lock(&self.log).committed
    }

    /// Records appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.log).records.len()
    }

    /// Whether nothing was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Subscriber for ScriptedSubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<RecordStream, BrokerError>> {
        let topic = self.topic.clone();
        let log = Arc::clone(&self.log);
        let appended = Arc::clone(&self.appended);

        Box::pin(async move {
            let stream = async_stream::stream! {
                let mut position = lock(&log).committed;
                loop {
                    let notified = appended.notified();
                    let (next, closed) = {
                        let log = lock(&log);
                        (log.records.get(position).cloned(), log.closed)
                    };
                    let Some((key, payload)) = next else {
                        if closed {
                            break;
                        }
                        notified.await;
                        continue;
                    };

                    let offset = i64::try_from(position).unwrap_or(i64::MAX);
                    let ack_log = Arc::clone(&log);
                    let ack = Box::new(move || {
                        let mut log = lock(&ack_log);
                        log.acked.push(offset);
                        log.committed = log.committed.max(position + 1);
                    });
                    position += 1;
                    yield Ok(DeliveredRecord::new(topic.clone(), 0, offset, key, payload, ack));
                }
            };
            Ok(Box::pin(stream) as RecordStream)
        })
    }
}

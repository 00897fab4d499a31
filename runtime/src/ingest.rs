//! Inbox ingest: broker records in, deduplicated inbox rows out.
//!
//! The ingest worker carries no business logic. For every record it finds
//! the logical id, inserts the inbox row on its own pooled connection, and
//! acknowledges the record whatever happened. Redelivered records collide
//! on the id and are counted as duplicates.

use crate::metrics::InboxMetrics;
use crate::worker::sleep_or_shutdown;
use courier_core::broker::{DeliveredRecord, Subscriber};
use courier_core::handler::{DecodeError, IdExtractor};
use courier_core::message::{AddOutcome, InboxMessage};
use courier_core::store::{InboxStore, StoreError};
use courier_core::transaction::Executor;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration for an [`InboxIngest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Pause before subscribing again after the stream ended or failed.
    ///
    /// Default: 5 seconds
    pub resubscribe_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

impl IngestConfig {
    /// Set the resubscribe delay.
    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}

/// What happened to one ingested record. The record is acknowledged in
/// every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as a new inbox message
    Inserted,
    /// Already in the inbox; nothing changed
    Duplicate,
    /// No id could be decoded; the record is dropped
    Dropped(DecodeError),
    /// The insert failed; the record is lost to this consumer group
    Failed(StoreError),
}

/// Worker feeding one topic into the inbox.
///
/// The inbox row's `event_type` is the topic the record came from and its
/// payload is the record value.
pub struct InboxIngest<Tx> {
    inbox: Arc<dyn InboxStore<Tx = Tx>>,
    subscriber: Arc<dyn Subscriber>,
    extractor: Arc<dyn IdExtractor>,
    config: IngestConfig,
    name: String,
}

impl<Tx> Clone for InboxIngest<Tx> {
    fn clone(&self) -> Self {
        Self {
            inbox: Arc::clone(&self.inbox),
            subscriber: Arc::clone(&self.subscriber),
            extractor: Arc::clone(&self.extractor),
            config: self.config.clone(),
            name: self.name.clone(),
        }
    }
}

impl<Tx: Send + 'static> InboxIngest<Tx> {
    /// Create an ingest worker.
    #[must_use]
    pub fn new(
        inbox: Arc<dyn InboxStore<Tx = Tx>>,
        subscriber: Arc<dyn Subscriber>,
        extractor: Arc<dyn IdExtractor>,
        config: IngestConfig,
    ) -> Self {
        Self {
            inbox,
            subscriber,
            extractor,
            config,
            name: "inbox-ingest".to_string(),
        }
    }

    /// Set the name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Store one record in the inbox and acknowledge it.
    ///
    /// The record is acknowledged whatever the outcome, including
    /// [`IngestOutcome::Failed`]: a record the store could not take is not
    /// redelivered to this consumer group.
    pub async fn absorb(&self, record: DeliveredRecord) -> IngestOutcome {
        let outcome = match self.extractor.extract(&record) {
            Ok(id) => {
                let message = InboxMessage::new(
                    id,
                    record.topic.clone(),
                    record.payload.clone().unwrap_or_default(),
                );
                match self.inbox.add(Executor::Pool, &message).await {
                    Ok(AddOutcome::Inserted) => {
                        InboxMetrics::record_ingested();
                        tracing::debug!(
                            worker = %self.name,
                            message_id = %message.id,
                            topic = %record.topic,
                            "Inbox message stored"
                        );
                        IngestOutcome::Inserted
                    },
                    Ok(AddOutcome::Duplicate) => {
                        InboxMetrics::record_duplicate();
                        tracing::debug!(
                            worker = %self.name,
                            message_id = %message.id,
                            "Duplicate record ignored"
                        );
                        IngestOutcome::Duplicate
                    },
                    Err(e) => {
                        InboxMetrics::record_ingest_failure();
                        tracing::error!(
                            worker = %self.name,
                            message_id = %message.id,
                            topic = %record.topic,
                            offset = record.offset,
                            error = %e,
                            "Failed to store inbox message, acknowledging anyway"
                        );
                        IngestOutcome::Failed(e)
                    },
                }
            },
            Err(e) => {
                InboxMetrics::record_dropped();
                tracing::warn!(
                    worker = %self.name,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping undecodable record"
                );
                IngestOutcome::Dropped(e)
            },
        };

        record.acknowledge();
        outcome
    }

    /// Consume the topic until `shutdown` turns `true`.
    ///
    /// When the subscription cannot be opened or its stream ends, the
    /// worker waits `resubscribe_delay` and subscribes again, resuming at
    /// the consumer group's committed offset. A record being absorbed when
    /// the signal arrives is finished and acknowledged first.
    ///
    /// Every record is acknowledged after [`absorb`](Self::absorb), even when
    /// the inbox insert failed. During a store outage the records consumed
    /// are therefore lost for this consumer group; only a replay from an
    /// earlier offset brings them back.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let topic = self.subscriber.topic().to_string();
        tracing::info!(worker = %self.name, topic = %topic, "Inbox ingest started");

        'session: while !*shutdown.borrow() {
            let mut stream = match self.subscriber.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(
                        worker = %self.name,
                        topic = %topic,
                        error = %e,
                        "Subscription failed"
                    );
                    if sleep_or_shutdown(self.config.resubscribe_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(record)) => {
                            self.absorb(record).await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(
                                worker = %self.name,
                                topic = %topic,
                                error = %e,
                                "Error receiving record"
                            );
                        }
                        None => {
                            tracing::warn!(
                                worker = %self.name,
                                topic = %topic,
                                "Record stream ended, resubscribing"
                            );
                            break;
                        }
                    },

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!(worker = %self.name, "Shutdown signal received");
                            break 'session;
                        }
                    }
                }
            }

            if sleep_or_shutdown(self.config.resubscribe_delay, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(worker = %self.name, topic = %topic, "Inbox ingest stopped");
    }
}

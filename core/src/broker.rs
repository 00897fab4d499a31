//! Broker abstraction for shipping outbox messages between services.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  1. Outbox row  │◄─── Committed with the domain change
//! └────────┬────────┘
//!          │ harvester
//!          ▼
//! ┌─────────────────┐
//! │ 2. Publish      │◄─── acks=all, bounded retries, key = message id
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ 3. Subscriber   │◄─── Consumer group, manual offset commit
//! └────────┬────────┘
//!          │ ingest
//!          ▼
//! ┌─────────────────┐
//! │ 4. Inbox row    │◄─── Dedup on id, then acknowledge
//! └─────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: Records may be delivered multiple times
//! - **Acknowledge after absorb**: A record's offset is committed only once
//!   the ingest worker has attempted to store it
//! - **Ordered within partition**: Records sharing a key keep their order
//!
//! # Implementations
//!
//! - `RedpandaPublisher` / `RedpandaSubscriber` (in `courier-redpanda`): Production (Kafka-compatible)
//! - `RecordingPublisher` / `ScriptedSubscriber` (in `courier-testing`): For testing

use futures::Stream;
use futures::future::BoxFuture;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit a consumer offset
    #[error("Offset commit failed: {0}")]
    CommitFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A record to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// Record value
    pub payload: Vec<u8>,
}

impl OutgoingRecord {
    /// Create a new outgoing record.
    #[must_use]
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
        }
    }
}

/// Publishes records to the broker.
///
/// Implementations must only return `Ok` once the broker has durably
/// accepted the record (all in-sync replicas acknowledged), retrying
/// transient failures a bounded number of times before giving up.
pub trait Publisher: Send + Sync {
    /// Publish one record.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the record could not be
    /// delivered within the configured retries.
    fn publish<'a>(&'a self, record: &'a OutgoingRecord) -> BoxFuture<'a, Result<(), BrokerError>>;
}

/// Callback committing one record's consumer offset.
pub type AckFn = Box<dyn FnOnce() + Send>;

/// A record delivered by a subscription.
///
/// The record must be acknowledged with [`DeliveredRecord::acknowledge`] once
/// it has been handled. Dropping it unacknowledged leaves its offset
/// uncommitted, so the broker redelivers it after a restart or rebalance.
pub struct DeliveredRecord {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Record value, if any
    pub payload: Option<Vec<u8>>,
    ack: Option<AckFn>,
}

impl DeliveredRecord {
    /// Create a delivered record with its acknowledgement callback.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        ack: AckFn,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            payload,
            ack: Some(ack),
        }
    }

    /// The record key decoded as UTF-8, if present and valid.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Commit this record's offset.
    pub fn acknowledge(mut self) {
        if let Some(ack) = self.ack.take() {
            ack();
        }
    }
}

impl fmt::Debug for DeliveredRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveredRecord")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key_str())
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Stream of records from a subscription.
///
/// Transport errors are yielded in-band; the stream ends when the
/// underlying consumer shuts down.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<DeliveredRecord, BrokerError>> + Send>>;

/// Durable consumer-group subscription to one topic.
///
/// Restarts resume from the group's last committed offset and concurrent
/// members split the topic's partitions between them.
pub trait Subscriber: Send + Sync {
    /// Topic this subscriber consumes.
    fn topic(&self) -> &str;

    /// Join the consumer group and start streaming records.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    fn subscribe(&self) -> BoxFuture<'_, Result<RecordStream, BrokerError>>;
}

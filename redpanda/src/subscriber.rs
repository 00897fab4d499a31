//! Consumer-group subscription with per-record offset commits.

use courier_core::broker::{BrokerError, DeliveredRecord, RecordStream, Subscriber};
use futures::StreamExt;
use futures::future::BoxFuture;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};

/// Logs consumer-group session changes.
struct SessionContext {
    group: String,
}

fn describe(partitions: &TopicPartitionList) -> Vec<String> {
    partitions
        .elements()
        .iter()
        .map(|p| format!("{}/{}", p.topic(), p.partition()))
        .collect()
}

impl ClientContext for SessionContext {}

impl ConsumerContext for SessionContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => tracing::info!(
                consumer_group = %self.group,
                partitions = ?describe(partitions),
                "Partitions assigned"
            ),
            Rebalance::Revoke(partitions) => tracing::info!(
                consumer_group = %self.group,
                partitions = ?describe(partitions),
                "Partitions revoked"
            ),
            Rebalance::Error(e) => tracing::warn!(
                consumer_group = %self.group,
                error = %e,
                "Rebalance failed"
            ),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            tracing::warn!(
                consumer_group = %self.group,
                partitions = ?describe(offsets),
                error = %e,
                "Offset commit failed (records may be redelivered)"
            );
        }
    }
}

/// Subscriber joining a Kafka consumer group on one topic.
///
/// Auto-commit is disabled. A spawned task owns the consumer and hands out
/// one record at a time; it commits that record's offset only after the
/// record is acknowledged, then fetches the next. If a record is dropped
/// without acknowledgement the task stops without committing and the
/// stream ends, so a new subscription resumes at that record.
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaSubscriber;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let subscriber = RedpandaSubscriber::builder()
///     .brokers("localhost:9092")
///     .topic("order.payments")
///     .consumer_group("payment-service")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedpandaSubscriber {
    brokers: String,
    topic: String,
    consumer_group: String,
    auto_offset_reset: String,
    session_timeout_ms: u32,
}

impl RedpandaSubscriber {
    /// Create a new builder for configuring the subscriber.
    #[must_use]
    pub fn builder() -> RedpandaSubscriberBuilder {
        RedpandaSubscriberBuilder::default()
    }

    /// The consumer group this subscriber joins.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Builder for configuring a [`RedpandaSubscriber`].
#[derive(Default, Debug, Clone)]
pub struct RedpandaSubscriberBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout_ms: Option<u32>,
}

impl RedpandaSubscriberBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Instances sharing a group split the topic's partitions; the group's
    /// committed offsets survive restarts.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a group without committed offsets starts reading.
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6000 ms
    #[must_use]
    pub const fn session_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.session_timeout_ms = Some(timeout_ms);
        self
    }

    /// Build the [`RedpandaSubscriber`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers, topic or
    /// consumer group are missing.
    pub fn build(self) -> Result<RedpandaSubscriber, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| BrokerError::ConnectionFailed("Topic not configured".to_string()))?;
        let consumer_group = self.consumer_group.ok_or_else(|| {
            BrokerError::ConnectionFailed("Consumer group not configured".to_string())
        })?;

        Ok(RedpandaSubscriber {
            brokers,
            topic,
            consumer_group,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout_ms: self.session_timeout_ms.unwrap_or(6000),
        })
    }
}

impl Subscriber for RedpandaSubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    #[allow(clippy::too_many_lines)] // One task owns the consumer for the whole session
    fn subscribe(&self) -> BoxFuture<'_, Result<RecordStream, BrokerError>> {
        Box::pin(async move {
            let subscription_error = |reason: String| BrokerError::SubscriptionFailed {
                topic: self.topic.clone(),
                reason,
            };

            let consumer: StreamConsumer<SessionContext> = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", self.session_timeout_ms.to_string())
                .set("enable.partition.eof", "false")
                .create_with_context(SessionContext {
                    group: self.consumer_group.clone(),
                })
                .map_err(|e| subscription_error(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(&[self.topic.as_str()])
                .map_err(|e| subscription_error(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topic = %self.topic,
                consumer_group = %self.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let (tx, mut rx) = mpsc::channel::<Result<DeliveredRecord, BrokerError>>(1);

            tokio::spawn(async move {
                let mut stream = consumer.stream();

                loop {
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = stream.next() => next,
                    };
                    let Some(result) = next else { break };

                    let message = match result {
                        Ok(message) => message,
                        Err(e) => {
                            let err = BrokerError::Transport(format!("Failed to receive record: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let (ack_tx, ack_rx) = oneshot::channel::<()>();
                    let record = DeliveredRecord::new(
                        message.topic(),
                        message.partition(),
                        message.offset(),
                        message.key().map(<[u8]>::to_vec),
                        message.payload().map(<[u8]>::to_vec),
                        Box::new(move || {
                            let _ = ack_tx.send(());
                        }),
                    );

                    if tx.send(Ok(record)).await.is_err() {
                        tracing::debug!("Record receiver dropped, exiting consumer task");
                        break;
                    }

                    if ack_rx.await.is_err() {
                        // Dropped unacknowledged: leave the offset for redelivery
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Record dropped without acknowledgement, ending session"
                        );
                        break;
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (record may be redelivered)"
                        );
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(stream.boxed())
        })
    }
}

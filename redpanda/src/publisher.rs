//! Durable record publisher.

use courier_core::broker::{BrokerError, OutgoingRecord, Publisher};
use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Publisher backed by an rdkafka [`FutureProducer`].
///
/// `publish` resolves only once the broker has acknowledged the record
/// (`acks=all` by default) or librdkafka has given up after its internal
/// send retries. Idempotent production is off: a retried send may write
/// the record twice, which the downstream inbox absorbs.
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaPublisher;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = RedpandaPublisher::builder()
///     .brokers("localhost:9092")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl RedpandaPublisher {
    /// Create a publisher with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }
}

/// Builder for configuring a [`RedpandaPublisher`].
#[derive(Default, Debug, Clone)]
pub struct RedpandaPublisherBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    timeout: Option<Duration>,
    send_retries: Option<u32>,
}

impl RedpandaPublisherBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all"
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set the delivery timeout for one publish, internal retries included.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many times librdkafka re-sends a record before failing it.
    ///
    /// Default: 10
    #[must_use]
    pub const fn send_retries(mut self, retries: u32) -> Self {
        self.send_retries = Some(retries);
        self
    }

    /// Build the [`RedpandaPublisher`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaPublisher, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.acks.unwrap_or_else(|| "all".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let send_retries = self.send_retries.unwrap_or(10);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("acks", &acks)
            .set("enable.idempotence", "false")
            .set("message.send.max.retries", send_retries.to_string())
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            send_retries,
            timeout_ms = timeout.as_millis(),
            "RedpandaPublisher created"
        );

        Ok(RedpandaPublisher { producer, timeout })
    }
}

impl Publisher for RedpandaPublisher {
    fn publish<'a>(&'a self, record: &'a OutgoingRecord) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let kafka_record = FutureRecord::to(&record.topic)
                .key(&record.key)
                .payload(&record.payload);

            match self
                .producer
                .send(kafka_record, Timeout::After(self.timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %record.topic,
                        message_id = %record.key,
                        partition,
                        offset,
                        "Record published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %record.topic,
                        message_id = %record.key,
                        error = %kafka_error,
                        "Failed to publish record"
                    );
                    Err(BrokerError::PublishFailed {
                        topic: record.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

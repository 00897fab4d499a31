//! Redpanda broker adapters for Courier.
//!
//! This crate implements the [`Publisher`] and [`Subscriber`] seams from
//! `courier-core` with rdkafka, so the relay works against Redpanda, Apache
//! Kafka or any other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** end to end:
//! - [`RedpandaPublisher`] waits for `acks=all` and retries sends inside
//!   librdkafka; a record may be written more than once
//! - [`RedpandaSubscriber`] disables auto-commit and commits a record's
//!   offset only after the ingest worker acknowledges it
//! - Records are keyed by message id, so ordering holds per message, not
//!   per entity
//!
//! # Example
//!
//! ```no_run
//! use courier_redpanda::{RedpandaPublisher, RedpandaSubscriber};
//! use courier_core::broker::{OutgoingRecord, Publisher, Subscriber};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = RedpandaPublisher::new("localhost:9092")?;
//! publisher
//!     .publish(&OutgoingRecord::new("order.payments", "A", b"{}".to_vec()))
//!     .await?;
//!
//! let subscriber = RedpandaSubscriber::builder()
//!     .brokers("localhost:9092")
//!     .topic("order.payments")
//!     .consumer_group("payment-service")
//!     .build()?;
//! let mut records = subscriber.subscribe().await?;
//! while let Some(record) = records.next().await {
//!     let record = record?;
//!     // ... store it ...
//!     record.acknowledge();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`Publisher`]: courier_core::broker::Publisher
//! [`Subscriber`]: courier_core::broker::Subscriber

mod publisher;
mod subscriber;

pub use publisher::{RedpandaPublisher, RedpandaPublisherBuilder};
pub use subscriber::{RedpandaSubscriber, RedpandaSubscriberBuilder};

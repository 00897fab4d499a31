//! # Courier Core
//!
//! Core traits and types for relaying events between services through a
//! transactional outbox, a log-based broker and a transactional inbox.
//!
//! ## Core Concepts
//!
//! - **Executor**: The explicit unit-of-work handle threaded through every
//!   repository call (pooled connection or open transaction)
//! - **Transactor**: Opens, commits and rolls back units of work
//! - **Outbox / Inbox stores**: Claimable durable queues with skip-locked claims
//! - **Publisher / Subscriber**: The narrow broker seams the workers depend on
//! - **Inbox handler**: The business logic applied to inbox messages
//!
//! ## Message Flow
//!
//! ```text
//! ┌──────────────────┐   one tx    ┌──────────┐
//! │ business write   │────────────►│  outbox  │
//! └──────────────────┘             └────┬─────┘
//!                                       │ harvester (lease, publish, mark)
//!                                       ▼
//!                                 ┌──────────┐
//!                                 │  broker  │
//!                                 └────┬─────┘
//!                                      │ ingest (dedup, ack)
//!                                      ▼
//!                                 ┌──────────┐   one tx    ┌──────────────┐
//!                                 │  inbox   │────────────►│ handler +    │
//!                                 └──────────┘   apply     │ mark applied │
//!                                                          └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::message::{MessageId, OutboxMessage};
//! use courier_core::transaction::{Executor, with_transaction};
//!
//! with_transaction(&db, Executor::Pool, move |tx| Box::pin(async move {
//!     orders.create(Executor::Tx(&mut *tx), &order).await?;
//!     outbox.add(Executor::Tx(tx), &OutboxMessage::new(
//!         MessageId::generate(),
//!         "order.payments",
//!         payload,
//!     )).await
//! })).await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Message types stored in the outbox and inbox tables
pub mod message;

/// Unit-of-work handles and the transaction coordinator contract
pub mod transaction;

/// Outbox and inbox store capabilities
pub mod store;

/// Broker publish / subscribe seams
pub mod broker;

/// Inbox handler and ingest decoding seams
pub mod handler;

/// Environment module - Injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Lease arithmetic in the outbox harvester reads time through this trait
    /// so tests can move time past a lease without sleeping.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

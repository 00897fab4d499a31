//! Outbox and inbox store capabilities.
//!
//! Both stores are *claimable durable queues*: a claim returns unprocessed
//! rows and locks them for the duration of the caller's transaction,
//! skipping rows another transaction already holds. Workers are written
//! against these traits only, so any backend with an atomic claim primitive
//! (Postgres `FOR UPDATE SKIP LOCKED`, the in-memory store in
//! `courier-testing`, a compare-and-swap log store) runs them unchanged.
//!
//! # Implementations
//!
//! - `PostgresOutboxStore` / `PostgresInboxStore` (in `courier-postgres`): Production
//! - `InMemoryOutboxStore` / `InMemoryInboxStore` (in `courier-testing`): Fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return explicit boxed futures instead of `async fn` so the stores
//! can be held as `Arc<dyn OutboxStore<Tx = ...>>`.

use crate::message::{AddOutcome, InboxMessage, MessageId, OutboxMessage};
use crate::transaction::Executor;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row with the same primary key already exists.
    #[error("Message {id} already exists")]
    Conflict {
        /// The colliding id
        id: MessageId,
    },

    /// The addressed row does not exist.
    #[error("Message {id} not found")]
    NotFound {
        /// The missing id
        id: MessageId,
    },

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Failure opening, committing or rolling back a transaction.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl StoreError {
    /// Whether this error is a primary-key collision.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Durable queue of not-yet-delivered events.
///
/// Written by business logic inside the transaction of the domain change it
/// announces; leased and drained by the outbox harvester.
pub trait OutboxStore: Send + Sync {
    /// Transaction handle accepted through [`Executor::Tx`]
    type Tx: Send + 'static;

    /// Insert a new message.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if a message with the same id exists
    /// - [`StoreError::Database`] if the insert fails
    fn add<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        message: &'a OutboxMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Claim up to `limit` unprocessed messages whose lease is absent or has
    /// run out at `now`.
    ///
    /// Claimed rows stay locked until the caller's transaction ends; rows
    /// locked by a concurrent caller are skipped rather than waited on, so
    /// two concurrent claims never return overlapping rows. With
    /// [`Executor::Pool`] the lock is released as soon as the statement
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<OutboxMessage>, StoreError>>;

    /// Set the lease of a message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn set_reserved<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        id: &'a MessageId,
        until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Mark a message as delivered. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Durable, deduplicated queue of not-yet-applied incoming events.
pub trait InboxStore: Send + Sync {
    /// Transaction handle accepted through [`Executor::Tx`]
    type Tx: Send + 'static;

    /// Insert a message unless one with the same id already exists.
    ///
    /// An id collision is the normal outcome of broker redelivery and is
    /// reported as [`AddOutcome::Duplicate`], never as an error. The
    /// existing row (including its `processed` flag) is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails for any other reason.
    fn add<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<AddOutcome, StoreError>>;

    /// Claim up to `limit` unprocessed messages, skipping rows locked by a
    /// concurrent caller. There is no lease: claims last exactly as long as
    /// the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<InboxMessage>, StoreError>>;

    /// Mark a message as applied. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_error_display() {
        let error = StoreError::Conflict { id: MessageId::new("A") };
        assert!(error.is_conflict());
        assert_eq!(error.to_string(), "Message A already exists");
    }

    #[test]
    fn database_error_is_not_a_conflict() {
        let error = StoreError::Database("connection reset".to_string());
        assert!(!error.is_conflict());
        assert!(error.to_string().contains("connection reset"));
    }
}

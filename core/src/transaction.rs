//! Unit-of-work handles and the transaction coordinator contract.
//!
//! Every repository call takes an [`Executor`] naming where it runs: on a
//! pooled connection, or inside the caller's open transaction. Threading the
//! handle explicitly lets an outbox write and the domain write it announces
//! share one atomic unit without either repository knowing about the other.
//!
//! # Example
//!
//! ```ignore
//! use courier_core::transaction::{Executor, with_transaction};
//!
//! let accounts = Arc::clone(&accounts);
//! let outbox = Arc::clone(&outbox);
//! with_transaction(&*db, Executor::Pool, move |tx| Box::pin(async move {
//!     accounts.debit(Executor::Tx(&mut *tx), user_id, amount).await?;
//!     outbox.add(Executor::Tx(tx), &message).await?;
//!     Ok::<_, StoreError>(())
//! })).await?;
//! ```

use crate::store::StoreError;
use futures::future::BoxFuture;
use std::fmt;

/// The executor a repository operation runs on.
///
/// `Pool` statements autocommit individually; `Tx` statements join the
/// borrowed transaction and commit or roll back with it.
pub enum Executor<'a, Tx> {
    /// No ambient transaction: draw a pooled connection
    Pool,
    /// Run inside the caller's open unit of work
    Tx(&'a mut Tx),
}

impl<Tx> Executor<'_, Tx> {
    /// Reborrow this executor for a single call, keeping it usable afterwards.
    pub fn reborrow(&mut self) -> Executor<'_, Tx> {
        match self {
            Self::Pool => Executor::Pool,
            Self::Tx(tx) => Executor::Tx(&mut **tx),
        }
    }

    /// Whether calls on this executor join an open transaction.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(self, Self::Tx(_))
    }
}

impl<'a, Tx> From<&'a mut Tx> for Executor<'a, Tx> {
    fn from(tx: &'a mut Tx) -> Self {
        Self::Tx(tx)
    }
}

impl<Tx> fmt::Debug for Executor<'_, Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => f.write_str("Executor::Pool"),
            Self::Tx(_) => f.write_str("Executor::Tx"),
        }
    }
}

/// Opens, commits and rolls back units of work against one store.
///
/// Implementations own no data: they only hand out transaction handles
/// that repository calls borrow through [`Executor::Tx`].
pub trait Transactor: Send + Sync {
    /// Open transaction handle
    type Tx: Send + 'static;

    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if no transaction can be opened.
    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx, StoreError>>;

    /// Commit a transaction, making its writes visible and releasing its locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if the commit fails; the writes are
    /// then lost.
    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Roll back a transaction, discarding its writes and releasing its locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if the rollback could not be sent.
    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Run `f` as one unit of work.
///
/// - With [`Executor::Pool`]: begins a transaction, runs `f` with it, commits
///   on `Ok` and rolls back on `Err`, returning `f`'s error.
/// - With [`Executor::Tx`]: runs `f` inside the caller's transaction. No
///   nested transaction is opened and nothing is committed or rolled back;
///   the outer owner decides.
///
/// The closure returns a boxed future borrowing the transaction, so anything
/// else it uses must be owned (clone `Arc`s in before the call).
///
/// # Errors
///
/// Returns `f`'s error, or a [`StoreError`] converted into `E` if the
/// transaction could not be opened or committed.
pub async fn with_transaction<T, F, R, E>(
    transactor: &T,
    executor: Executor<'_, T::Tx>,
    f: F,
) -> Result<R, E>
where
    T: Transactor + ?Sized,
    F: for<'c> FnOnce(&'c mut T::Tx) -> BoxFuture<'c, Result<R, E>> + Send,
    R: Send,
    E: From<StoreError> + fmt::Display + Send,
{
    match executor {
        Executor::Tx(tx) => f(tx).await,
        Executor::Pool => {
            let mut tx = transactor.begin().await?;
            match f(&mut tx).await {
                Ok(value) => {
                    transactor.commit(tx).await?;
                    Ok(value)
                },
                Err(err) => {
                    if let Err(rollback_err) = transactor.rollback(tx).await {
                        tracing::warn!(
                            error = %err,
                            rollback_error = %rollback_err,
                            "Rollback failed after unit of work error"
                        );
                    }
                    Err(err)
                },
            }
        },
    }
}

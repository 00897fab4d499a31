//! Payment accounts.

use courier_core::store::StoreError;
use courier_core::transaction::Executor;
use courier_postgres::PgTx;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Account balances, one row per user.
///
/// Every call takes an [`Executor`] so balance changes can join the
/// transaction that marks the causing inbox message applied.
pub trait AccountStore: Send + Sync {
    /// Transaction handle accepted through [`Executor::Tx`]
    type Tx: Send + 'static;

    /// Open an empty account.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the user already has an account
    /// - [`StoreError::Database`] if the insert fails
    fn create<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Current balance, or `None` if the user has no account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn balance<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<i64>, StoreError>>;

    /// Subtract `amount` if the balance covers it.
    ///
    /// The check and the write are one statement, so concurrent debits of
    /// one account can never overdraw it. Returns `false`, changing nothing,
    /// when the balance is too low or the user has no account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn debit<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        user_id: Uuid,
        amount: i64,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Add `delta` (negative to withdraw) to the balance, unchecked.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the user has no account
    /// - [`StoreError::Database`] if the update fails
    fn change_balance<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        user_id: Uuid,
        delta: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// `accounts` table access.
#[derive(Clone, Debug)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    /// Create a store on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn database_error(e: &sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl AccountStore for PostgresAccountStore {
    type Tx = PgTx;

    fn create<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = sqlx::query("INSERT INTO accounts (user_id, amount) VALUES ($1, 0)").bind(user_id);
            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            };

            match result {
                Ok(_) => {
                    tracing::info!(%user_id, "Account created");
                    Ok(())
                },
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    Err(StoreError::Conflict {
                        id: user_id.into(),
                    })
                },
                Err(e) => Err(database_error(&e)),
            }
        })
    }

    fn balance<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<i64>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query("SELECT amount FROM accounts WHERE user_id = $1").bind(user_id);
            let row = match executor {
                Executor::Pool => query.fetch_optional(&self.pool).await,
                Executor::Tx(tx) => query.fetch_optional(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            row.map(|row| row.try_get("amount").map_err(|e| database_error(&e)))
                .transpose()
        })
    }

    fn debit<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        user_id: Uuid,
        amount: i64,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            // Under READ COMMITTED a blocked UPDATE re-checks its WHERE
            // against the committed row, so a racing debit sees the new amount.
            let query = sqlx::query(
                "UPDATE accounts SET amount = amount - $1 WHERE user_id = $2 AND amount >= $1",
            )
            .bind(amount)
            .bind(user_id);
            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            let debited = result.rows_affected() == 1;
            tracing::debug!(%user_id, amount, debited, "Debit attempted");
            Ok(debited)
        })
    }

    fn change_balance<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        user_id: Uuid,
        delta: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = sqlx::query("UPDATE accounts SET amount = amount + $1 WHERE user_id = $2")
                .bind(delta)
                .bind(user_id);
            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    id: user_id.into(),
                });
            }
            tracing::debug!(%user_id, delta, "Balance changed");
            Ok(())
        })
    }
}

/// Apply the embedded `accounts` migration.
///
/// Courier's own migrations share the version table and are ignored here.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the migration fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    tracing::info!("Accounts migration applied");
    Ok(())
}

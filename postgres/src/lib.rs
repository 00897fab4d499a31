//! `PostgreSQL` outbox / inbox stores for Courier.
//!
//! This crate provides the production backend behind the store traits in
//! `courier-core`:
//!
//! - [`PgDatabase`]: the [`Transactor`] handing out `sqlx` transactions
//! - [`PostgresOutboxStore`]: leased, skip-locked outbox claims
//! - [`PostgresInboxStore`]: deduplicating inbox inserts
//! - [`run_migrations`]: the embedded schema
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED`, so any number of worker
//! instances, in any number of processes, can drain the same tables without
//! coordinating outside the database.
//!
//! # Example
//!
//! ```ignore
//! use courier_postgres::{PgDatabase, PostgresOutboxStore, run_migrations};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = PgDatabase::connect("postgres://localhost/payments", 10).await?;
//!     run_migrations(db.pool()).await?;
//!     let outbox = PostgresOutboxStore::new(db.pool().clone());
//!     Ok(())
//! }
//! ```

use courier_core::store::StoreError;
use courier_core::transaction::Transactor;
use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

mod inbox;
mod outbox;

pub use inbox::PostgresInboxStore;
pub use outbox::PostgresOutboxStore;

/// Open `PostgreSQL` transaction.
pub type PgTx = sqlx::Transaction<'static, Postgres>;

/// Transaction coordinator over a `PgPool`.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone, Debug)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Transactor for PgDatabase {
    type Tx = PgTx;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx, StoreError>> {
        Box::pin(async move {
            self.pool
                .begin()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))
        })
    }

    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            tx.commit()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))
        })
    }

    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            tx.rollback()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))
        })
    }
}

/// Apply the embedded outbox and inbox migrations.
///
/// Versions applied by the host service's own migrator are ignored, so
/// both can share one `_sqlx_migrations` table.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    tracing::info!("Outbox and inbox migrations applied");
    Ok(())
}

/// Record how long one store statement took.
fn record_query(table: &'static str, operation: &'static str, started: std::time::Instant) {
    metrics::histogram!(
        "courier_store_query_duration_seconds",
        "table" => table,
        "operation" => operation
    )
    .record(started.elapsed().as_secs_f64());
}

fn database_error(e: &sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Convert a batch size to a SQL `LIMIT`.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

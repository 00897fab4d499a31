//! Orders and their persistence.

use courier_core::store::StoreError;
use courier_core::transaction::Executor;
use courier_postgres::PgTx;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Placed, payment requested
    New,
    /// Payment completed
    Finished,
    /// Abandoned
    Cancelled,
}

impl OrderStatus {
    /// Column value of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "finished" => Ok(Self::Finished),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// A placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id; also the id of its payment request
    pub id: Uuid,
    /// Ordering user
    pub user_id: Uuid,
    /// Free-form description
    pub description: String,
    /// Price to be paid
    pub amount: i64,
    /// Current status
    pub status: OrderStatus,
}

impl Order {
    /// A new order with a fresh id.
    #[must_use]
    pub fn new(user_id: Uuid, description: impl Into<String>, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            description: description.into(),
            amount,
            status: OrderStatus::New,
        }
    }
}

/// Order rows.
///
/// Calls take an [`Executor`] so an order and its payment request can be
/// written in one transaction.
pub trait OrderStore: Send + Sync {
    /// Transaction handle accepted through [`Executor::Tx`]
    type Tx: Send + 'static;

    /// Insert an order.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if an order with this id exists
    /// - [`StoreError::Database`] if the insert fails
    fn create<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// The order with `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn get<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<Order>, StoreError>>;

    /// All orders of `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn list_for_user<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<Order>, StoreError>>;

    /// Move an order to `status`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no order has this id
    /// - [`StoreError::Database`] if the update fails
    fn set_status<'a>(
        &'a self,
        executor: Executor<'a, Self::Tx>,
        id: Uuid,
        status: OrderStatus,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// `orders` table access.
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a store on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn database_error(e: &sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status").map_err(|e| database_error(&e))?;
    Ok(Order {
        id: row.try_get("id").map_err(|e| database_error(&e))?,
        user_id: row.try_get("user_id").map_err(|e| database_error(&e))?,
        description: row.try_get("description").map_err(|e| database_error(&e))?,
        amount: row.try_get("amount").map_err(|e| database_error(&e))?,
        status: status.parse().map_err(StoreError::Database)?,
    })
}

impl OrderStore for PostgresOrderStore {
    type Tx = PgTx;

    fn create<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                "INSERT INTO orders (id, user_id, description, amount, status)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(order.id)
            .bind(order.user_id)
            .bind(&order.description)
            .bind(order.amount)
            .bind(order.status.as_str());
            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            };

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    Err(StoreError::Conflict { id: order.id.into() })
                },
                Err(e) => Err(database_error(&e)),
            }
        })
    }

    fn get<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<Order>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                "SELECT id, user_id, description, amount, status FROM orders WHERE id = $1",
            )
            .bind(id);
            let row = match executor {
                Executor::Pool => query.fetch_optional(&self.pool).await,
                Executor::Tx(tx) => query.fetch_optional(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            row.as_ref().map(order_from_row).transpose()
        })
    }

    fn list_for_user<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<Order>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                "SELECT id, user_id, description, amount, status FROM orders WHERE user_id = $1",
            )
            .bind(user_id);
            let rows = match executor {
                Executor::Pool => query.fetch_all(&self.pool).await,
                Executor::Tx(tx) => query.fetch_all(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            rows.iter().map(order_from_row).collect()
        })
    }

    fn set_status<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        id: Uuid,
        status: OrderStatus,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
                .bind(status.as_str())
                .bind(id);
            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound { id: id.into() });
            }
            tracing::debug!(order_id = %id, %status, "Order status changed");
            Ok(())
        })
    }
}

/// Apply the embedded `orders` migration.
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
    tracing::info!("Orders migration applied");
    Ok(())
}

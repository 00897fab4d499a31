//! `PostgreSQL` outbox store.

use crate::{PgTx, database_error, record_query, sql_limit};
use chrono::{DateTime, Utc};
use courier_core::message::{MessageId, OutboxMessage};
use courier_core::store::{OutboxStore, StoreError};
use courier_core::transaction::Executor;
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Instant;

/// Outbox table access.
///
/// # Example
///
/// ```no_run
/// use courier_core::message::{MessageId, OutboxMessage};
/// use courier_core::store::OutboxStore;
/// use courier_core::transaction::{Executor, Transactor};
/// use courier_postgres::{PgDatabase, PostgresOutboxStore};
///
/// # async fn example(db: PgDatabase) -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = PostgresOutboxStore::new(db.pool().clone());
///
/// let mut tx = db.begin().await?;
/// // ... domain writes on &mut tx ...
/// let message = OutboxMessage::new(MessageId::generate(), "order.payments", b"{}".to_vec());
/// outbox.add(Executor::Tx(&mut tx), &message).await?;
/// db.commit(tx).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &PgRow) -> Result<OutboxMessage, StoreError> {
        let id: String = row.try_get("id").map_err(|e| database_error(&e))?;
        Ok(OutboxMessage {
            id: MessageId::from(id),
            event_type: row.try_get("event_type").map_err(|e| database_error(&e))?,
            payload: row.try_get("payload").map_err(|e| database_error(&e))?,
            processed: row.try_get("processed").map_err(|e| database_error(&e))?,
            reserved_until: row.try_get("reserved_until").map_err(|e| database_error(&e))?,
        })
    }

    /// Run an `UPDATE` addressed by id, failing when no row matched.
    async fn update_one(
        &self,
        executor: Executor<'_, PgTx>,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        id: &MessageId,
    ) -> Result<(), StoreError> {
        let result = match executor {
            Executor::Pool => query.execute(&self.pool).await,
            Executor::Tx(tx) => query.execute(&mut **tx).await,
        }
        .map_err(|e| database_error(&e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        Ok(())
    }
}

impl OutboxStore for PostgresOutboxStore {
    type Tx = PgTx;

    fn add<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        message: &'a OutboxMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query(
                r"
                INSERT INTO outbox (id, event_type, payload, processed, reserved_until)
                VALUES ($1, $2, $3, false, NULL)
                ",
            )
            .bind(message.id.as_str())
            .bind(&message.event_type)
            .bind(&message.payload);

            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            };
            record_query("outbox", "add", started);

            match result {
                Ok(_) => {
                    tracing::debug!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        "Outbox message added"
                    );
                    Ok(())
                },
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(StoreError::Conflict {
                        id: message.id.clone(),
                    })
                },
                Err(e) => Err(database_error(&e)),
            }
        })
    }

    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<OutboxMessage>, StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query(
                r"
                SELECT id, event_type, payload, processed, reserved_until
                FROM outbox
                WHERE processed = false
                  AND (reserved_until IS NULL OR reserved_until <= $1)
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .bind(sql_limit(limit));

            let rows = match executor {
                Executor::Pool => query.fetch_all(&self.pool).await,
                Executor::Tx(tx) => query.fetch_all(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;
            record_query("outbox", "get_unprocessed", started);

            rows.iter().map(Self::row_to_message).collect()
        })
    }

    fn set_reserved<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        id: &'a MessageId,
        until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query("UPDATE outbox SET reserved_until = $2 WHERE id = $1")
                .bind(id.as_str())
                .bind(until);
            let result = self.update_one(executor, query, id).await;
            record_query("outbox", "set_reserved", started);
            result
        })
    }

    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query("UPDATE outbox SET processed = true WHERE id = $1")
                .bind(id.as_str());
            let result = self.update_one(executor, query, id).await;
            record_query("outbox", "mark_processed", started);
            result
        })
    }
}

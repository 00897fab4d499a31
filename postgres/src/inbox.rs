//! `PostgreSQL` inbox store.

use crate::{PgTx, database_error, record_query, sql_limit};
use courier_core::message::{AddOutcome, InboxMessage, MessageId};
use courier_core::store::{InboxStore, StoreError};
use courier_core::transaction::Executor;
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Instant;

/// Inbox table access.
///
/// Redelivered events collide on the primary key; `add` turns the
/// collision into [`AddOutcome::Duplicate`] with `ON CONFLICT DO NOTHING`,
/// so a duplicate never aborts the caller's transaction.
#[derive(Clone, Debug)]
pub struct PostgresInboxStore {
    pool: PgPool,
}

impl PostgresInboxStore {
    /// Create a store on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &PgRow) -> Result<InboxMessage, StoreError> {
        let id: String = row.try_get("id").map_err(|e| database_error(&e))?;
        Ok(InboxMessage {
            id: MessageId::from(id),
            event_type: row.try_get("event_type").map_err(|e| database_error(&e))?,
            payload: row.try_get("payload").map_err(|e| database_error(&e))?,
            processed: row.try_get("processed").map_err(|e| database_error(&e))?,
        })
    }
}

impl InboxStore for PostgresInboxStore {
    type Tx = PgTx;

    fn add<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<AddOutcome, StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query(
                r"
                INSERT INTO inbox (id, event_type, payload, processed)
                VALUES ($1, $2, $3, false)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(message.id.as_str())
            .bind(&message.event_type)
            .bind(&message.payload);

            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;
            record_query("inbox", "add", started);

            if result.rows_affected() == 0 {
                metrics::counter!("courier_store_inbox_conflicts_total").increment(1);
                Ok(AddOutcome::Duplicate)
            } else {
                Ok(AddOutcome::Inserted)
            }
        })
    }

    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<InboxMessage>, StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query(
                r"
                SELECT id, event_type, payload, processed
                FROM inbox
                WHERE processed = false
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(sql_limit(limit));

            let rows = match executor {
                Executor::Pool => query.fetch_all(&self.pool).await,
                Executor::Tx(tx) => query.fetch_all(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;
            record_query("inbox", "get_unprocessed", started);

            rows.iter().map(Self::row_to_message).collect()
        })
    }

    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, PgTx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let started = Instant::now();
            let query = sqlx::query("UPDATE inbox SET processed = true WHERE id = $1")
                .bind(id.as_str());

            let result = match executor {
                Executor::Pool => query.execute(&self.pool).await,
                Executor::Tx(tx) => query.execute(&mut **tx).await,
            }
            .map_err(|e| database_error(&e))?;
            record_query("inbox", "mark_processed", started);

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound { id: id.clone() });
            }
            Ok(())
        })
    }
}

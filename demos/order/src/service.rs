//! Placing orders and reading them back.

use crate::orders::{Order, OrderStatus, OrderStore};
use courier_core::message::{MessageId, OutboxMessage};
use courier_core::store::{OutboxStore, StoreError};
use courier_core::transaction::{Executor, Transactor, with_transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Payment request announced for every new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Order to pay
    pub order_id: Uuid,
    /// Paying user
    pub user_id: Uuid,
    /// Amount to debit
    pub amount: i64,
}

/// Errors returned by [`OrderService`].
#[derive(Error, Debug)]
pub enum OrderError {
    /// The request was refused before touching the database
    #[error("Invalid order: {0}")]
    Invalid(String),

    /// No order has the requested id
    #[error("Order not found: {0}")]
    NotFound(Uuid),

    /// The payment request could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Store failure; any transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Order operations over one database.
pub struct OrderService<D: Transactor + 'static> {
    db: Arc<D>,
    orders: Arc<dyn OrderStore<Tx = D::Tx>>,
    outbox: Arc<dyn OutboxStore<Tx = D::Tx>>,
    payment_event: String,
}

impl<D: Transactor + 'static> OrderService<D> {
    /// Create a service announcing payment requests as `payment_event`.
    #[must_use]
    pub fn new(
        db: Arc<D>,
        orders: Arc<dyn OrderStore<Tx = D::Tx>>,
        outbox: Arc<dyn OutboxStore<Tx = D::Tx>>,
        payment_event: impl Into<String>,
    ) -> Self {
        Self {
            db,
            orders,
            outbox,
            payment_event: payment_event.into(),
        }
    }

    /// Place an order and enqueue its [`PaymentRequest`].
    ///
    /// The order row and the outbox row commit together; the outbox
    /// harvester publishes the request afterwards.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Invalid`] for a non-positive amount
    /// - [`OrderError::Store`] if either write fails; nothing is kept
    pub async fn create_order(
        &self,
        user_id: Uuid,
        description: impl Into<String>,
        amount: i64,
    ) -> Result<Order, OrderError> {
        if amount <= 0 {
            return Err(OrderError::Invalid(format!("amount must be positive, got {amount}")));
        }

        let order = Order::new(user_id, description, amount);
        let request = PaymentRequest {
            order_id: order.id,
            user_id,
            amount,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| OrderError::Encode(e.to_string()))?;
        let message = OutboxMessage::new(MessageId::generate(), self.payment_event.clone(), payload);

        let orders = Arc::clone(&self.orders);
        let outbox = Arc::clone(&self.outbox);
        let placed = order.clone();
        with_transaction(&*self.db, Executor::Pool, move |tx| {
            Box::pin(async move {
                orders.create(Executor::Tx(&mut *tx), &placed).await?;
                outbox.add(Executor::Tx(&mut *tx), &message).await?;
                Ok::<_, OrderError>(())
            })
        })
        .await?;

        tracing::info!(order_id = %order.id, %user_id, amount, "Order created");
        Ok(order)
    }

    /// The order with `order_id`.
    ///
    /// # Errors
    ///
    /// - [`OrderError::NotFound`] if there is no such order
    /// - [`OrderError::Store`] if the query fails
    pub async fn order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders
            .get(Executor::Pool, order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Status of the order with `order_id`.
    ///
    /// # Errors
    ///
    /// Same as [`OrderService::order`].
    pub async fn order_status(&self, order_id: Uuid) -> Result<OrderStatus, OrderError> {
        Ok(self.order(order_id).await?.status)
    }

    /// Every order placed by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Store`] if the query fails.
    pub async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, OrderError> {
        Ok(self.orders.list_for_user(Executor::Pool, user_id).await?)
    }
}

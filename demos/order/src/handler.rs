//! Settles orders from the payment service's completions.

use crate::orders::{OrderStatus, OrderStore};
use courier_core::handler::{HandlerError, InboxHandler};
use courier_core::message::InboxMessage;
use courier_core::store::StoreError;
use courier_core::transaction::Executor;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A settled payment announced by the payment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Order that was paid
    pub order_id: Uuid,
    /// User that paid
    pub user_id: Uuid,
}

/// Marks the paid order finished.
///
/// A completion for an unknown order is rejected and stays in the inbox.
/// Finishing an already finished order is a no-op.
pub struct PaymentCompletedHandler<Tx> {
    orders: Arc<dyn OrderStore<Tx = Tx>>,
}

impl<Tx> PaymentCompletedHandler<Tx> {
    /// Create a handler over `orders`.
    #[must_use]
    pub fn new(orders: Arc<dyn OrderStore<Tx = Tx>>) -> Self {
        Self { orders }
    }
}

impl<Tx: Send + 'static> InboxHandler<Tx> for PaymentCompletedHandler<Tx> {
    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let completed: PaymentCompleted = serde_json::from_slice(&message.payload)
                .map_err(|e| HandlerError::Decode(e.to_string()))?;

            match self
                .orders
                .set_status(Executor::Tx(&mut *tx), completed.order_id, OrderStatus::Finished)
                .await
            {
                Ok(()) => {},
                Err(StoreError::NotFound { .. }) => {
                    return Err(HandlerError::Rejected(format!(
                        "order {} not found",
                        completed.order_id
                    )));
                },
                Err(e) => return Err(e.into()),
            }

            tracing::info!(
                order_id = %completed.order_id,
                user_id = %completed.user_id,
                "Order finished"
            );
            Ok(())
        })
    }
}

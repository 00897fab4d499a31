//! Applies payment requests from the order service.

use crate::accounts::AccountStore;
use courier_core::handler::{HandlerError, InboxHandler};
use courier_core::message::{InboxMessage, MessageId, OutboxMessage};
use courier_core::store::OutboxStore;
use courier_core::transaction::Executor;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A payment request published by the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequested {
    /// Order being paid; also the inbox id of the request
    pub order_id: Uuid,
    /// Paying user
    pub user_id: Uuid,
    /// Amount to debit
    pub amount: i64,
}

/// Announces a settled payment back to the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Order that was paid
    pub order_id: Uuid,
    /// User that paid
    pub user_id: Uuid,
}

/// Debits the paying account and enqueues a [`PaymentCompleted`] event in
/// the same transaction.
///
/// A request for an unknown account, a non-positive amount, or one the
/// balance cannot cover, is rejected. The balance check and the debit are
/// a single conditional update, so apply workers racing on one account
/// cannot overdraw it. The request then stays in the inbox and is tried again on
/// every apply tick, so a later deposit lets it through.
pub struct PaymentHandler<Tx> {
    accounts: Arc<dyn AccountStore<Tx = Tx>>,
    outbox: Arc<dyn OutboxStore<Tx = Tx>>,
    completed_event: String,
}

impl<Tx> PaymentHandler<Tx> {
    /// Create a handler writing completions with `completed_event` as their
    /// event type.
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore<Tx = Tx>>,
        outbox: Arc<dyn OutboxStore<Tx = Tx>>,
        completed_event: impl Into<String>,
    ) -> Self {
        Self {
            accounts,
            outbox,
            completed_event: completed_event.into(),
        }
    }
}

impl<Tx: Send + 'static> InboxHandler<Tx> for PaymentHandler<Tx> {
    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let request: PaymentRequested = serde_json::from_slice(&message.payload)
                .map_err(|e| HandlerError::Decode(e.to_string()))?;

            if request.amount <= 0 {
                return Err(HandlerError::Rejected(format!(
                    "invalid amount {}",
                    request.amount
                )));
            }

            let debited = self
                .accounts
                .debit(Executor::Tx(&mut *tx), request.user_id, request.amount)
                .await?;
            if !debited {
                let balance = self
                    .accounts
                    .balance(Executor::Tx(&mut *tx), request.user_id)
                    .await?
                    .ok_or_else(|| {
                        HandlerError::Rejected(format!("account {} not found", request.user_id))
                    })?;
                tracing::warn!(
                    order_id = %request.order_id,
                    user_id = %request.user_id,
                    balance,
                    amount = request.amount,
                    "Insufficient funds"
                );
                return Err(HandlerError::Rejected("insufficient funds".to_string()));
            }

            let completed = PaymentCompleted {
                order_id: request.order_id,
                user_id: request.user_id,
            };
            let payload =
                serde_json::to_vec(&completed).map_err(|e| HandlerError::Decode(e.to_string()))?;
            self.outbox
                .add(
                    Executor::Tx(&mut *tx),
                    &OutboxMessage::new(MessageId::generate(), self.completed_event.clone(), payload),
                )
                .await?;

            tracing::info!(
                order_id = %request.order_id,
                user_id = %request.user_id,
                amount = request.amount,
                "Payment processed"
            );
            Ok(())
        })
    }
}

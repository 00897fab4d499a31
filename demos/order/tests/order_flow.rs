//! Order and payment services relaying through one in-memory broker.
//!
//! Each service has its own database; records travel between them only
//! through the outbox harvester, the scripted topics and the inbox.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use courier_core::broker::{BrokerError, OutgoingRecord, Publisher, Subscriber};
use courier_core::handler::{HandlerError, InboxHandler, JsonFieldId};
use courier_core::message::{InboxMessage, MessageId};
use courier_core::store::{InboxStore, OutboxStore, StoreError};
use courier_core::transaction::Executor;
use courier_runtime::{
    ApplyConfig, HarvesterConfig, InboxApplier, InboxIngest, IngestConfig, IngestOutcome,
    OutboxHarvester, WorkerError,
};
use courier_testing::{
    InMemoryDatabase, InMemoryInboxStore, InMemoryOutboxStore, MemoryTx, ScriptedSubscriber,
    test_clock,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use order_demo::{
    Order, OrderError, OrderService, OrderStatus, OrderStore, PaymentCompleted,
    PaymentCompletedHandler, PaymentRequest,
};
use payment_demo::{AccountStore, PaymentHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// In-memory domain stores
// ============================================================================

/// Orders whose status lives in a transactional counter.
///
/// The descriptive fields are kept aside; an order is visible only once its
/// status counter is, so a rolled back create leaves nothing behind.
struct MemoryOrders {
    db: InMemoryDatabase,
    details: Mutex<HashMap<Uuid, Order>>,
}

fn status_key(id: Uuid) -> String {
    format!("order:{id}")
}

const fn status_code(status: OrderStatus) -> i64 {
    match status {
        OrderStatus::New => 0,
        OrderStatus::Finished => 1,
        OrderStatus::Cancelled => 2,
    }
}

fn status_from_code(code: i64) -> OrderStatus {
    match code {
        0 => OrderStatus::New,
        1 => OrderStatus::Finished,
        _ => OrderStatus::Cancelled,
    }
}

impl MemoryOrders {
    fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            details: Mutex::new(HashMap::new()),
        }
    }

    fn visible(&self, executor: Executor<'_, MemoryTx>, id: Uuid) -> Result<Option<Order>, StoreError> {
        let Some(code) = self.db.counter(executor, &status_key(id))? else {
            return Ok(None);
        };
        Ok(self.details.lock().unwrap().get(&id).cloned().map(|mut order| {
            order.status = status_from_code(code);
            order
        }))
    }
}

impl OrderStore for MemoryOrders {
    type Tx = MemoryTx;

    fn create<'a>(
        &'a self,
        mut executor: Executor<'a, MemoryTx>,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let key = status_key(order.id);
            if self.db.counter(executor.reborrow(), &key)?.is_some() {
                return Err(StoreError::Conflict { id: order.id.into() });
            }
            self.details.lock().unwrap().insert(order.id, order.clone());
            self.db.set_counter(executor, &key, status_code(order.status))
        })
    }

    fn get<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<Order>, StoreError>> {
        Box::pin(async move { self.visible(executor, id) })
    }

    fn list_for_user<'a>(
        &'a self,
        mut executor: Executor<'a, MemoryTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<Order>, StoreError>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = self
                .details
                .lock()
                .unwrap()
                .values()
                .filter(|order| order.user_id == user_id)
                .map(|order| order.id)
                .collect();
            let mut orders = Vec::new();
            for id in ids {
                if let Some(order) = self.visible(executor.reborrow(), id)? {
                    orders.push(order);
                }
            }
            Ok(orders)
        })
    }

    fn set_status<'a>(
        &'a self,
        mut executor: Executor<'a, MemoryTx>,
        id: Uuid,
        status: OrderStatus,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let key = status_key(id);
            if self.db.counter(executor.reborrow(), &key)?.is_none() {
                return Err(StoreError::NotFound { id: id.into() });
            }
            self.db.set_counter(executor, &key, status_code(status))
        })
    }
}

/// Balances kept in the payment database's counters.
struct MemoryAccounts {
    db: InMemoryDatabase,
}

fn balance_key(user_id: Uuid) -> String {
    format!("balance:{user_id}")
}

impl AccountStore for MemoryAccounts {
    type Tx = MemoryTx;

    fn create<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.db.set_counter(executor, &balance_key(user_id), 0) })
    }

    fn balance<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<i64>, StoreError>> {
        Box::pin(async move { self.db.counter(executor, &balance_key(user_id)) })
    }

    fn debit<'a>(
        &'a self,
        mut executor: Executor<'a, MemoryTx>,
        user_id: Uuid,
        amount: i64,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let key = balance_key(user_id);
            match self.db.counter(executor.reborrow(), &key)? {
                Some(balance) if balance >= amount => {
                    self.db.set_counter(executor, &key, balance - amount)?;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn change_balance<'a>(
        &'a self,
        mut executor: Executor<'a, MemoryTx>,
        user_id: Uuid,
        delta: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let key = balance_key(user_id);
            let balance = self
                .db
                .counter(executor.reborrow(), &key)?
                .ok_or(StoreError::NotFound { id: user_id.into() })?;
            self.db.set_counter(executor, &key, balance + delta)
        })
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Routes each published record to the scripted topic of the same name.
#[derive(Clone)]
struct Broker {
    topics: Arc<HashMap<&'static str, ScriptedSubscriber>>,
}

impl Broker {
    fn new(topics: &[&'static str]) -> Self {
        Self {
            topics: Arc::new(
                topics
                    .iter()
                    .map(|topic| (*topic, ScriptedSubscriber::new(*topic)))
                    .collect(),
            ),
        }
    }

    fn topic(&self, name: &str) -> ScriptedSubscriber {
        self.topics[name].clone()
    }
}

impl Publisher for Broker {
    fn publish<'a>(&'a self, record: &'a OutgoingRecord) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let topic = self
                .topics
                .get(record.topic.as_str())
                .ok_or_else(|| BrokerError::PublishFailed {
                    topic: record.topic.clone(),
                    reason: "unknown topic".to_string(),
                })?;
            topic.push(Some(&record.key), Some(&record.payload));
            Ok(())
        })
    }
}

// ============================================================================
// Services
// ============================================================================

/// The three workers of one service, driven tick by tick.
struct Workers {
    harvester: OutboxHarvester<InMemoryDatabase>,
    ingest: InboxIngest<MemoryTx>,
    applier: InboxApplier<InMemoryDatabase>,
    inbound: ScriptedSubscriber,
}

impl Workers {
    fn new(
        db: &InMemoryDatabase,
        broker: &Broker,
        inbound: &str,
        handler: Arc<dyn InboxHandler<MemoryTx>>,
    ) -> Self {
        let outbox: Arc<dyn OutboxStore<Tx = MemoryTx>> = Arc::new(InMemoryOutboxStore::new(db.clone()));
        let inbox: Arc<dyn InboxStore<Tx = MemoryTx>> = Arc::new(InMemoryInboxStore::new(db.clone()));
        let inbound = broker.topic(inbound);
        Self {
            harvester: OutboxHarvester::new(
                Arc::new(db.clone()),
                outbox,
                Arc::new(broker.clone()),
                Arc::new(test_clock()),
                HarvesterConfig::default(),
            ),
            ingest: InboxIngest::new(
                Arc::clone(&inbox),
                Arc::new(inbound.clone()),
                Arc::new(JsonFieldId::new("order_id")),
                IngestConfig::default(),
            ),
            applier: InboxApplier::new(Arc::new(db.clone()), inbox, handler, ApplyConfig::default()),
            inbound,
        }
    }

    /// Absorb every record appended to the inbound topic and not yet acknowledged.
    async fn ingest_pending(&self) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::new();
        if self.inbound.committed_offset() == self.inbound.len() {
            return outcomes;
        }
        let mut stream = self.inbound.subscribe().await.unwrap();
        while self.inbound.committed_offset() < self.inbound.len() {
            let record = stream.next().await.unwrap().unwrap();
            outcomes.push(self.ingest.absorb(record).await);
        }
        outcomes
    }
}

struct System {
    orders_db: InMemoryDatabase,
    payments_db: InMemoryDatabase,
    accounts: Arc<MemoryAccounts>,
    service: OrderService<InMemoryDatabase>,
    order_side: Workers,
    payment_side: Workers,
}

impl System {
    fn new() -> Self {
        let broker = Broker::new(&["order.payments", "payment.completed"]);

        let orders_db = InMemoryDatabase::new();
        let orders: Arc<dyn OrderStore<Tx = MemoryTx>> = Arc::new(MemoryOrders::new(orders_db.clone()));
        let requests: Arc<dyn OutboxStore<Tx = MemoryTx>> =
            Arc::new(InMemoryOutboxStore::new(orders_db.clone()));
        let service = OrderService::new(
            Arc::new(orders_db.clone()),
            Arc::clone(&orders),
            requests,
            "order.payments",
        );
        let order_side = Workers::new(
            &orders_db,
            &broker,
            "payment.completed",
            Arc::new(PaymentCompletedHandler::new(orders)),
        );

        let payments_db = InMemoryDatabase::new();
        let accounts = Arc::new(MemoryAccounts {
            db: payments_db.clone(),
        });
        let completions: Arc<dyn OutboxStore<Tx = MemoryTx>> =
            Arc::new(InMemoryOutboxStore::new(payments_db.clone()));
        let payment_side = Workers::new(
            &payments_db,
            &broker,
            "order.payments",
            Arc::new(PaymentHandler::new(
                Arc::clone(&accounts) as Arc<dyn AccountStore<Tx = MemoryTx>>,
                completions,
                "payment.completed",
            )),
        );

        Self {
            orders_db,
            payments_db,
            accounts,
            service,
            order_side,
            payment_side,
        }
    }

    async fn open_account(&self, balance: i64) -> Uuid {
        let user_id = Uuid::new_v4();
        self.accounts.create(Executor::Pool, user_id).await.unwrap();
        self.accounts
            .change_balance(Executor::Pool, user_id, balance)
            .await
            .unwrap();
        user_id
    }

    async fn balance(&self, user_id: Uuid) -> Option<i64> {
        self.accounts.balance(Executor::Pool, user_id).await.unwrap()
    }

    /// One round trip: request out, payment applied, completion back.
    async fn relay_round(&self) -> Result<(), WorkerError> {
        self.order_side.harvester.tick().await?;
        self.payment_side.ingest_pending().await;
        let paid = self.payment_side.applier.tick().await;
        self.payment_side.harvester.tick().await?;
        self.order_side.ingest_pending().await;
        self.order_side.applier.tick().await?;
        paid.map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_paid_order_is_finished() {
    let system = System::new();
    let user_id = system.open_account(100).await;

    let order = system.service.create_order(user_id, "two books", 40).await.unwrap();
    assert_eq!(order.status, OrderStatus::New);

    let requests = system.orders_db.outbox_rows();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].event_type, "order.payments");
    let request: PaymentRequest = serde_json::from_slice(&requests[0].payload).unwrap();
    assert_eq!(
        request,
        PaymentRequest {
            order_id: order.id,
            user_id,
            amount: 40,
        }
    );

    system.relay_round().await.unwrap();

    assert_eq!(system.balance(user_id).await, Some(60));
    assert_eq!(
        system.service.order_status(order.id).await.unwrap(),
        OrderStatus::Finished
    );
    assert!(system.orders_db.outbox_rows().iter().all(|row| row.processed));
    assert!(system.payments_db.outbox_rows().iter().all(|row| row.processed));
    assert!(
        system
            .orders_db
            .inbox_row(&order.id.to_string())
            .unwrap()
            .processed
    );
}

#[tokio::test]
async fn test_unpaid_order_stays_new_until_funds_arrive() {
    let system = System::new();
    let user_id = system.open_account(10).await;
    let order = system.service.create_order(user_id, "lamp", 30).await.unwrap();

    let result = system.relay_round().await;
    assert!(matches!(
        result,
        Err(WorkerError::Handler(HandlerError::Rejected(ref reason))) if reason == "insufficient funds"
    ));
    assert_eq!(
        system.service.order_status(order.id).await.unwrap(),
        OrderStatus::New
    );

    system
        .accounts
        .change_balance(Executor::Pool, user_id, 25)
        .await
        .unwrap();
    system.relay_round().await.unwrap();

    assert_eq!(system.balance(user_id).await, Some(5));
    assert_eq!(
        system.service.order_status(order.id).await.unwrap(),
        OrderStatus::Finished
    );
}

#[tokio::test]
async fn test_redelivered_completion_finishes_the_order_once() {
    let system = System::new();
    let user_id = system.open_account(100).await;
    let order = system.service.create_order(user_id, "desk", 70).await.unwrap();
    system.relay_round().await.unwrap();

    let completion = serde_json::to_vec(&PaymentCompleted {
        order_id: order.id,
        user_id,
    })
    .unwrap();
    system
        .order_side
        .inbound
        .push(Some("replayed"), Some(&completion));

    let outcomes = system.order_side.ingest_pending().await;
    assert_eq!(outcomes, vec![IngestOutcome::Duplicate]);
    assert_eq!(system.order_side.applier.tick().await.unwrap(), 0);
    assert_eq!(system.orders_db.inbox_rows().len(), 1);
}

#[tokio::test]
async fn test_completion_for_unknown_order_is_rejected() {
    let system = System::new();
    let orders_inbox = InMemoryInboxStore::new(system.orders_db.clone());
    let stray = Uuid::new_v4();
    orders_inbox
        .add(
            Executor::Pool,
            &InboxMessage::new(
                MessageId::from(stray),
                "payment.completed",
                serde_json::to_vec(&PaymentCompleted {
                    order_id: stray,
                    user_id: Uuid::new_v4(),
                })
                .unwrap(),
            ),
        )
        .await
        .unwrap();

    let result = system.order_side.applier.tick().await;

    assert!(matches!(
        result,
        Err(WorkerError::Handler(HandlerError::Rejected(ref reason))) if reason.contains("not found")
    ));
    assert!(!system.orders_db.inbox_row(&stray.to_string()).unwrap().processed);
}

#[tokio::test]
async fn test_failed_create_keeps_neither_order_nor_request() {
    let system = System::new();
    let user_id = Uuid::new_v4();
    system.orders_db.set_unavailable(true);

    let result = system.service.create_order(user_id, "chair", 15).await;

    assert!(matches!(result, Err(OrderError::Store(_))));
    system.orders_db.set_unavailable(false);
    assert!(system.orders_db.outbox_rows().is_empty());
    assert!(system.service.orders_for_user(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_positive_amount_is_refused_before_writing() {
    let system = System::new();

    let result = system.service.create_order(Uuid::new_v4(), "nothing", 0).await;

    assert!(matches!(result, Err(OrderError::Invalid(_))));
    assert!(system.orders_db.outbox_rows().is_empty());
}

#[tokio::test]
async fn test_orders_are_listed_per_user() {
    let system = System::new();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    system.service.create_order(alice, "pen", 2).await.unwrap();
    system.service.create_order(alice, "ink", 3).await.unwrap();
    let bobs = system.service.create_order(bob, "paper", 4).await.unwrap();

    let mut descriptions: Vec<_> = system
        .service
        .orders_for_user(alice)
        .await
        .unwrap()
        .into_iter()
        .map(|order| order.description)
        .collect();
    descriptions.sort();
    assert_eq!(descriptions, vec!["ink", "pen"]);
    assert_eq!(system.service.order(bobs.id).await.unwrap(), bobs);
    assert!(matches!(
        system.service.order(Uuid::new_v4()).await,
        Err(OrderError::NotFound(_))
    ));
}

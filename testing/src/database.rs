//! In-memory transactional backend for fast, deterministic tests.
//!
//! Provides:
//! - [`InMemoryDatabase`]: a [`Transactor`] with staged writes and row locks
//! - [`InMemoryOutboxStore`] / [`InMemoryInboxStore`]: store implementations
//!   sharing one database
//!
//! Writes made inside a [`MemoryTx`] are invisible to everyone else until
//! commit. Rows claimed or written by a transaction stay locked until it
//! commits, rolls back or is dropped; claims by other transactions skip
//! them, mirroring `FOR UPDATE SKIP LOCKED`.
//!
//! [`Executor::Pool`] calls run as single-statement transactions.

use chrono::{DateTime, Utc};
use courier_core::message::{AddOutcome, InboxMessage, MessageId, OutboxMessage};
use courier_core::store::{InboxStore, OutboxStore, StoreError};
use courier_core::transaction::{Executor, Transactor};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Table {
    Outbox,
    Inbox,
}

#[derive(Clone, Debug)]
enum Write {
    InsertOutbox(OutboxMessage),
    ReserveOutbox(MessageId, DateTime<Utc>),
    ProcessOutbox(MessageId),
    InsertInbox(InboxMessage),
    ProcessInbox(MessageId),
    SetCounter(String, i64),
}

/// Committed rows.
#[derive(Clone, Debug, Default)]
struct Data {
    outbox: Vec<OutboxMessage>,
    inbox: Vec<InboxMessage>,
    counters: BTreeMap<String, i64>,
}

impl Data {
    fn apply(&mut self, write: &Write) {
        match write {
            Write::InsertOutbox(message) => self.outbox.push(message.clone()),
            Write::ReserveOutbox(id, until) => {
                if let Some(row) = self.outbox.iter_mut().find(|m| &m.id == id) {
                    row.reserved_until = Some(*until);
                }
            },
            Write::ProcessOutbox(id) => {
                if let Some(row) = self.outbox.iter_mut().find(|m| &m.id == id) {
                    row.processed = true;
                }
            },
            Write::InsertInbox(message) => self.inbox.push(message.clone()),
            Write::ProcessInbox(id) => {
                if let Some(row) = self.inbox.iter_mut().find(|m| &m.id == id) {
                    row.processed = true;
                }
            },
            Write::SetCounter(key, value) => {
                self.counters.insert(key.clone(), *value);
            },
        }
    }
}

#[derive(Debug, Default)]
struct State {
    data: Data,
    locks: HashMap<(Table, MessageId), u64>,
}

impl State {
    /// What `tx` sees: committed rows plus its own staged writes.
    fn view(&self, tx: &MemoryTx) -> Data {
        let mut data = self.data.clone();
        for write in &tx.writes {
            data.apply(write);
        }
        data
    }

    fn locked_by_other(&self, key: &(Table, MessageId), tx: &MemoryTx) -> bool {
        self.locks.get(key).is_some_and(|owner| *owner != tx.id)
    }

    /// Take (or re-take) a row lock for `tx`.
    fn lock(&mut self, key: (Table, MessageId), tx: &mut MemoryTx) -> Result<(), StoreError> {
        match self.locks.get(&key) {
            Some(owner) if *owner == tx.id => Ok(()),
            Some(_) => Err(StoreError::Transaction(format!(
                "row {} is locked by another transaction",
                key.1
            ))),
            None => {
                self.locks.insert(key.clone(), tx.id);
                tx.locked.push(key);
                Ok(())
            },
        }
    }

    fn release(&mut self, tx: &mut MemoryTx) {
        for key in tx.locked.drain(..) {
            if self.locks.get(&key) == Some(&tx.id) {
                self.locks.remove(&key);
            }
        }
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open transaction on an [`InMemoryDatabase`].
///
/// Dropping it without commit behaves like a rollback.
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    writes: Vec<Write>,
    locked: Vec<(Table, MessageId)>,
    state: Arc<Mutex<State>>,
}

impl MemoryTx {
    /// Number of writes staged so far.
    #[must_use]
    pub fn staged_writes(&self) -> usize {
        self.writes.len()
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        let state = Arc::clone(&self.state);
        lock_state(&state).release(self);
    }
}

/// In-memory relational store shared by the in-memory outbox and inbox.
///
/// Also carries a small named-counter table so handler tests can make
/// "business" writes inside the same transaction as the inbox bookkeeping.
///
/// # Example
///
/// ```
/// use courier_testing::{InMemoryDatabase, InMemoryOutboxStore};
/// use courier_core::message::{MessageId, OutboxMessage};
/// use courier_core::store::OutboxStore;
/// use courier_core::transaction::Executor;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = InMemoryDatabase::new();
/// let outbox = InMemoryOutboxStore::new(db.clone());
///
/// outbox.add(Executor::Pool, &OutboxMessage::new(MessageId::new("A"), "t", vec![])).await?;
/// assert_eq!(db.outbox_rows().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    next_tx: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDatabase {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every operation fails with
    /// [`StoreError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Committed outbox rows in insertion order.
    #[must_use]
    pub fn outbox_rows(&self) -> Vec<OutboxMessage> {
        lock_state(&self.state).data.outbox.clone()
    }

    /// Committed inbox rows in insertion order.
    #[must_use]
    pub fn inbox_rows(&self) -> Vec<InboxMessage> {
        lock_state(&self.state).data.inbox.clone()
    }

    /// Committed outbox row with the given id.
    #[must_use]
    pub fn outbox_row(&self, id: &str) -> Option<OutboxMessage> {
        lock_state(&self.state)
            .data
            .outbox
            .iter()
            .find(|m| m.id.as_str() == id)
            .cloned()
    }

    /// Committed inbox row with the given id.
    #[must_use]
    pub fn inbox_row(&self, id: &str) -> Option<InboxMessage> {
        lock_state(&self.state)
            .data
            .inbox
            .iter()
            .find(|m| m.id.as_str() == id)
            .cloned()
    }

    /// Number of row locks currently held by open transactions.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        lock_state(&self.state).locks.len()
    }

    /// Read a named counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] while the database is unavailable.
    pub fn counter(&self, executor: Executor<'_, MemoryTx>, key: &str) -> Result<Option<i64>, StoreError> {
        self.execute(executor, |state, tx| Ok(state.view(tx).counters.get(key).copied()))
    }

    /// Write a named counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] while the database is unavailable.
    pub fn set_counter(
        &self,
        executor: Executor<'_, MemoryTx>,
        key: &str,
        value: i64,
    ) -> Result<(), StoreError> {
        self.execute(executor, |_, tx| {
            tx.writes.push(Write::SetCounter(key.to_string(), value));
            Ok(())
        })
    }

    fn open(&self) -> MemoryTx {
        MemoryTx {
            id: self.next_tx.fetch_add(1, Ordering::SeqCst),
            writes: Vec::new(),
            locked: Vec::new(),
            state: Arc::clone(&self.state),
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Database("database unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Run one statement on the given executor.
    fn execute<R>(
        &self,
        executor: Executor<'_, MemoryTx>,
        statement: impl FnOnce(&mut State, &mut MemoryTx) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check_available()?;
        match executor {
            Executor::Tx(tx) => statement(&mut lock_state(&self.state), tx),
            Executor::Pool => {
                let mut tx = self.open();
                let mut state = lock_state(&self.state);
                let result = statement(&mut state, &mut tx);
                if result.is_ok() {
                    for write in tx.writes.drain(..) {
                        state.data.apply(&write);
                    }
                }
                state.release(&mut tx);
                result
            },
        }
    }
}

impl Transactor for InMemoryDatabase {
    type Tx = MemoryTx;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx, StoreError>> {
        Box::pin(async move {
            self.check_available()
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            Ok(self.open())
        })
    }

    fn commit(&self, mut tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            if let Err(e) = self.check_available() {
                // Lost connection: nothing is applied, the drop releases locks
                return Err(StoreError::Transaction(e.to_string()));
            }
            let mut state = lock_state(&self.state);
            for write in tx.writes.drain(..) {
                state.data.apply(&write);
            }
            state.release(&mut tx);
            Ok(())
        })
    }

    fn rollback(&self, mut tx: Self::Tx) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            tx.writes.clear();
            lock_state(&self.state).release(&mut tx);
            Ok(())
        })
    }
}

/// In-memory [`OutboxStore`].
#[derive(Clone, Debug)]
pub struct InMemoryOutboxStore {
    db: InMemoryDatabase,
}

impl InMemoryOutboxStore {
    /// Create an outbox store on `db`.
    #[must_use]
    pub const fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

impl OutboxStore for InMemoryOutboxStore {
    type Tx = MemoryTx;

    fn add<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        message: &'a OutboxMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                let key = (Table::Outbox, message.id.clone());
                let exists = state.view(tx).outbox.iter().any(|m| m.id == message.id);
                if exists || state.locked_by_other(&key, tx) {
                    return Err(StoreError::Conflict {
                        id: message.id.clone(),
                    });
                }
                state.lock(key, tx)?;
                let mut row = message.clone();
                row.processed = false;
                tx.writes.push(Write::InsertOutbox(row));
                Ok(())
            })
        })
    }

    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<OutboxMessage>, StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                let candidates: Vec<OutboxMessage> = state
                    .view(tx)
                    .outbox
                    .into_iter()
                    .filter(|m| m.is_claimable(now))
                    .filter(|m| !state.locked_by_other(&(Table::Outbox, m.id.clone()), tx))
                    .take(limit)
                    .collect();
                for message in &candidates {
                    state.lock((Table::Outbox, message.id.clone()), tx)?;
                }
                Ok(candidates)
            })
        })
    }

    fn set_reserved<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        id: &'a MessageId,
        until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                if !state.view(tx).outbox.iter().any(|m| &m.id == id) {
                    return Err(StoreError::NotFound { id: id.clone() });
                }
                state.lock((Table::Outbox, id.clone()), tx)?;
                tx.writes.push(Write::ReserveOutbox(id.clone(), until));
                Ok(())
            })
        })
    }

    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                if !state.view(tx).outbox.iter().any(|m| &m.id == id) {
                    return Err(StoreError::NotFound { id: id.clone() });
                }
                state.lock((Table::Outbox, id.clone()), tx)?;
                tx.writes.push(Write::ProcessOutbox(id.clone()));
                Ok(())
            })
        })
    }
}

/// In-memory [`InboxStore`].
#[derive(Clone, Debug)]
pub struct InMemoryInboxStore {
    db: InMemoryDatabase,
}

impl InMemoryInboxStore {
    /// Create an inbox store on `db`.
    #[must_use]
    pub const fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

impl InboxStore for InMemoryInboxStore {
    type Tx = MemoryTx;

    fn add<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<AddOutcome, StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                let key = (Table::Inbox, message.id.clone());
                let exists = state.view(tx).inbox.iter().any(|m| m.id == message.id);
                if exists || state.locked_by_other(&key, tx) {
                    return Ok(AddOutcome::Duplicate);
                }
                state.lock(key, tx)?;
                let mut row = message.clone();
                row.processed = false;
                tx.writes.push(Write::InsertInbox(row));
                Ok(AddOutcome::Inserted)
            })
        })
    }

    fn get_unprocessed<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<InboxMessage>, StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                let candidates: Vec<InboxMessage> = state
                    .view(tx)
                    .inbox
                    .into_iter()
                    .filter(|m| !m.processed)
                    .filter(|m| !state.locked_by_other(&(Table::Inbox, m.id.clone()), tx))
                    .take(limit)
                    .collect();
                for message in &candidates {
                    state.lock((Table::Inbox, message.id.clone()), tx)?;
                }
                Ok(candidates)
            })
        })
    }

    fn mark_processed<'a>(
        &'a self,
        executor: Executor<'a, MemoryTx>,
        id: &'a MessageId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.db.execute(executor, |state, tx| {
                if !state.view(tx).inbox.iter().any(|m| &m.id == id) {
                    return Err(StoreError::NotFound { id: id.clone() });
                }
                state.lock((Table::Inbox, id.clone()), tx)?;
                tx.writes.push(Write::ProcessInbox(id.clone()));
                Ok(())
            })
        })
    }
}

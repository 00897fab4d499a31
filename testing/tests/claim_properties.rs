//! Claim semantics of the in-memory stores under arbitrary batches

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use courier_core::message::MessageId;
use courier_core::store::OutboxStore;
use courier_core::transaction::{Executor, Transactor};
use courier_testing::properties::outbox_batch;
use courier_testing::{InMemoryDatabase, InMemoryOutboxStore, test_clock};
use courier_core::environment::Clock;
use proptest::prelude::*;
use std::collections::HashSet;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn concurrent_claims_are_disjoint(
        batch in outbox_batch(20),
        first_limit in 0usize..25,
        second_limit in 0usize..25,
    ) {
        let (first, second) = runtime().block_on(async {
            let db = InMemoryDatabase::new();
            let outbox = InMemoryOutboxStore::new(db.clone());
            for message in &batch {
                outbox.add(Executor::Pool, message).await.unwrap();
            }

            let now = test_clock().now();
            let mut tx_a = db.begin().await.unwrap();
            let mut tx_b = db.begin().await.unwrap();
            let first = outbox.get_unprocessed(Executor::Tx(&mut tx_a), first_limit, now).await.unwrap();
            let second = outbox.get_unprocessed(Executor::Tx(&mut tx_b), second_limit, now).await.unwrap();
            (first, second)
        });

        let a: HashSet<MessageId> = first.into_iter().map(|m| m.id).collect();
        let b: HashSet<MessageId> = second.into_iter().map(|m| m.id).collect();
        prop_assert!(a.is_disjoint(&b));
        prop_assert_eq!(a.len(), first_limit.min(batch.len()));
        prop_assert_eq!(b.len(), second_limit.min(batch.len() - a.len()));
    }

    #[test]
    fn processed_never_reverts(batch in outbox_batch(10)) {
        let rows = runtime().block_on(async {
            let db = InMemoryDatabase::new();
            let outbox = InMemoryOutboxStore::new(db.clone());
            for message in &batch {
                outbox.add(Executor::Pool, message).await.unwrap();
                outbox.mark_processed(Executor::Pool, &message.id).await.unwrap();
            }

            // Later leases and repeated marks leave the flag set
            let now = test_clock().now();
            for message in &batch {
                outbox.set_reserved(Executor::Pool, &message.id, now).await.unwrap();
                outbox.mark_processed(Executor::Pool, &message.id).await.unwrap();
            }
            let claimable = outbox.get_unprocessed(Executor::Pool, 100, now).await.unwrap();
            assert!(claimable.is_empty());
            db.outbox_rows()
        });

        prop_assert!(rows.iter().all(|row| row.processed));
    }
}

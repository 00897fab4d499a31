//! # Payment service
//!
//! Settles order payments received over the broker and announces the
//! result, using all three Courier workers:
//!
//! 1. **Ingest** stores `order.payments` records in the inbox, keyed by
//!    their `order_id` so a redelivered request is recognised.
//! 2. **Apply** runs [`PaymentHandler`]: debit the account and enqueue a
//!    `payment.completed` outbox row, in the transaction that marks the
//!    request applied.
//! 3. **Harvest** publishes the completions.

pub mod accounts;
pub mod config;
pub mod handler;

pub use accounts::{AccountStore, PostgresAccountStore, run_migrations};
pub use config::Config;
pub use handler::{PaymentCompleted, PaymentHandler, PaymentRequested};

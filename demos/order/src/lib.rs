//! # Order service
//!
//! The requesting half of the payment flow:
//!
//! 1. [`OrderService::create_order`] writes the order and an
//!    `order.payments` outbox row in one transaction.
//! 2. **Harvest** publishes the request to the payment service.
//! 3. **Ingest** stores `payment.completed` records in the inbox, keyed by
//!    their `order_id`.
//! 4. **Apply** runs [`PaymentCompletedHandler`], which marks the order
//!    finished.

pub mod config;
pub mod handler;
pub mod orders;
pub mod service;

pub use config::Config;
pub use handler::{PaymentCompleted, PaymentCompletedHandler};
pub use orders::{Order, OrderStatus, OrderStore, PostgresOrderStore, run_migrations};
pub use service::{OrderError, OrderService, PaymentRequest};

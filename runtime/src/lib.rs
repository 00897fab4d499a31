//! # Courier Runtime
//!
//! The relay workers and their plumbing.
//!
//! - [`OutboxHarvester`]: leases outbox rows, publishes them, marks them processed
//! - [`InboxIngest`]: turns broker records into deduplicated inbox rows
//! - [`InboxApplier`]: runs an [`InboxHandler`](courier_core::handler::InboxHandler)
//!   over inbox rows, one transaction per tick
//! - [`WorkerSet`]: spawns worker instances and stops them on a shared signal
//!
//! Every worker exposes a single `tick` (or `absorb`) step for tests and a
//! `run` loop that repeats it until shutdown. A failed tick is logged and
//! retried on the next one; nothing a tick returns ends the loop.
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{HarvesterConfig, OutboxHarvester, WorkerSet};
//!
//! let harvester = OutboxHarvester::new(db, outbox, publisher, clock, HarvesterConfig::default());
//!
//! let mut workers = WorkerSet::new();
//! workers.spawn("outbox-harvester", 2, move |index, shutdown| {
//!     harvester.clone().with_name(format!("outbox-harvester-{index}")).run(shutdown)
//! });
//!
//! tokio::signal::ctrl_c().await?;
//! workers.shutdown().await;
//! ```

use courier_core::broker::BrokerError;
use courier_core::handler::{DecodeError, HandlerError};
use courier_core::store::StoreError;
use thiserror::Error;

/// Outbox harvester worker
pub mod harvester;

/// Inbox ingest worker
pub mod ingest;

/// Inbox apply worker
pub mod apply;

/// Worker fan-out and shutdown
pub mod worker;

/// Retry with exponential backoff
pub mod retry;

/// Prometheus metrics
pub mod metrics;

pub use apply::{ApplyConfig, InboxApplier};
pub use harvester::{HarvesterConfig, OutboxHarvester};
pub use ingest::{InboxIngest, IngestConfig, IngestOutcome};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use worker::WorkerSet;

/// Errors that abort a single worker tick.
///
/// The worker loops log these and try again on the next tick; they never
/// escape `run`.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Store or transaction failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broker failure
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Inbox handler failure
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Undecodable broker record
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

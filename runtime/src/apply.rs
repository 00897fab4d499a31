//! Inbox apply: runs business logic over stored inbox messages.

use crate::WorkerError;
use crate::worker::ticker;
use crate::metrics::{InboxMetrics, WorkerMetrics};
use courier_core::handler::InboxHandler;
use courier_core::store::InboxStore;
use courier_core::transaction::{Executor, Transactor, with_transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Configuration for an [`InboxApplier`].
///
/// # Default Values
///
/// - `period`: 5 seconds
/// - `batch_size`: 10
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Interval between ticks
    pub period: Duration,
    /// Maximum messages applied per tick
    pub batch_size: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            batch_size: 10,
        }
    }
}

impl ApplyConfig {
    /// Set the tick interval.
    #[must_use]
    pub const fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Set the maximum messages applied per tick.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Worker applying inbox messages through an [`InboxHandler`].
///
/// One tick is one transaction: claim a batch, hand each message and the
/// open transaction to the handler, mark it processed. If the handler fails
/// on any message the transaction rolls back, so neither the handler's
/// writes nor any `processed` flag of the batch survive, and the messages
/// are claimed again on a later tick.
///
/// A message the handler keeps rejecting is retried forever and holds back
/// the rest of its batch.
pub struct InboxApplier<D: Transactor + 'static> {
    db: Arc<D>,
    inbox: Arc<dyn InboxStore<Tx = D::Tx>>,
    handler: Arc<dyn InboxHandler<D::Tx>>,
    config: ApplyConfig,
    name: String,
}

impl<D: Transactor + 'static> Clone for InboxApplier<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            inbox: Arc::clone(&self.inbox),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            name: self.name.clone(),
        }
    }
}

impl<D: Transactor + 'static> InboxApplier<D> {
    /// Create an apply worker.
    #[must_use]
    pub fn new(
        db: Arc<D>,
        inbox: Arc<dyn InboxStore<Tx = D::Tx>>,
        handler: Arc<dyn InboxHandler<D::Tx>>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            db,
            inbox,
            handler,
            config,
            name: "inbox-apply".to_string(),
        }
    }

    /// Set the name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the configuration, keeping stores and handler.
    #[must_use]
    pub fn with_config(mut self, config: ApplyConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply one batch in one transaction.
    ///
    /// Returns the number of messages applied.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Handler`] if the handler failed; the tick was rolled back
    /// - [`WorkerError::Store`] if claiming, marking or committing failed
    pub async fn tick(&self) -> Result<usize, WorkerError> {
        let started = Instant::now();
        let inbox = Arc::clone(&self.inbox);
        let handler = Arc::clone(&self.handler);
        let batch_size = self.config.batch_size;
        let name = self.name.clone();

        let result = with_transaction(&*self.db, Executor::Pool, move |tx| {
            Box::pin(async move {
                let batch = inbox
                    .get_unprocessed(Executor::Tx(&mut *tx), batch_size)
                    .await?;

                for message in &batch {
                    if let Err(e) = handler.handle(&mut *tx, message).await {
                        tracing::warn!(
                            worker = %name,
                            message_id = %message.id,
                            event_type = %message.event_type,
                            error = %e,
                            "Inbox handler failed, rolling back batch"
                        );
                        return Err(WorkerError::from(e));
                    }
                    inbox
                        .mark_processed(Executor::Tx(&mut *tx), &message.id)
                        .await?;
                    tracing::debug!(worker = %name, message_id = %message.id, "Inbox message applied");
                }

                Ok::<_, WorkerError>(batch.len())
            })
        })
        .await;

        match result {
            Ok(applied) => {
                if applied > 0 {
                    InboxMetrics::record_applied(applied, started.elapsed());
                    tracing::info!(worker = %self.name, applied, "Inbox batch applied");
                }
                Ok(applied)
            },
            Err(e) => {
                if matches!(e, WorkerError::Handler(_)) {
                    InboxMetrics::record_apply_failure();
                }
                Err(e)
            },
        }
    }

    /// Tick every `period` until `shutdown` turns `true`.
    ///
    /// A tick in progress when the signal arrives commits or rolls back
    /// before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = ticker(&self.name, self.config.period);

        tracing::info!(
            worker = %self.name,
            period_ms = self.config.period.as_millis(),
            batch_size = self.config.batch_size,
            "Inbox applier started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        WorkerMetrics::record_tick_failure("inbox_apply");
                        tracing::error!(
                            worker = %self.name,
                            error = %e,
                            "Inbox apply tick failed"
                        );
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(worker = %self.name, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.name, "Inbox applier stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ApplyConfig::default();
        assert_eq!(config.period, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);

        let config = config
            .with_period(Duration::from_millis(250))
            .with_batch_size(1);
        assert_eq!(config.period, Duration::from_millis(250));
        assert_eq!(config.batch_size, 1);
    }
}

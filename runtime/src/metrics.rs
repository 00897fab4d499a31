//! Prometheus metrics for the relay workers.
//!
//! This module provides metric collection for:
//! - Outbox harvesting (claims, publishes, failures)
//! - Inbox ingest (inserts, duplicates, dropped records)
//! - Inbox apply (applied messages, handler failures)
//! - Store query latency (recorded by `courier-postgres`)
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this
    /// logs a warning, leaves the existing recorder in place and starts no
    /// listener.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(
                error = %e,
                "Metrics recorder already initialized, skipping re-initialization"
            );
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });

        register_metrics();
        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox
    describe_counter!(
        "courier_outbox_claimed_total",
        "Outbox messages leased by a harvester"
    );
    describe_counter!(
        "courier_outbox_published_total",
        "Outbox messages accepted by the broker"
    );
    describe_counter!(
        "courier_outbox_publish_failures_total",
        "Publishes that failed after all retries"
    );
    describe_histogram!(
        "courier_outbox_publish_duration_seconds",
        "Time taken to publish one outbox message, retries included"
    );

    // Inbox
    describe_counter!(
        "courier_inbox_ingested_total",
        "Broker records stored as new inbox messages"
    );
    describe_counter!(
        "courier_inbox_duplicates_total",
        "Broker records whose id was already in the inbox"
    );
    describe_counter!(
        "courier_inbox_dropped_total",
        "Broker records dropped because they could not be decoded"
    );
    describe_counter!(
        "courier_inbox_ingest_failures_total",
        "Broker records acknowledged after a failed inbox insert"
    );
    describe_counter!(
        "courier_inbox_applied_total",
        "Inbox messages applied by the handler"
    );
    describe_counter!(
        "courier_inbox_apply_failures_total",
        "Apply ticks rolled back because a handler failed"
    );
    describe_histogram!(
        "courier_inbox_apply_duration_seconds",
        "Time taken by one apply tick"
    );

    // Workers
    describe_counter!(
        "courier_worker_tick_failures_total",
        "Worker ticks aborted by an error"
    );

    // Stores
    describe_histogram!(
        "courier_store_query_duration_seconds",
        "Time taken by one store statement"
    );
    describe_counter!(
        "courier_store_inbox_conflicts_total",
        "Inbox inserts absorbed by the primary key"
    );

    // Retry
    describe_counter!(
        "courier_retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "courier_retry_exhausted_total",
        "Operations that failed after exhausting their retries"
    );
}

/// Outbox harvester metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a claimed batch.
    pub fn record_claimed(count: usize) {
        counter!("courier_outbox_claimed_total").increment(count as u64);
    }

    /// Record a successful publish.
    pub fn record_published(topic: &str, duration: Duration) {
        counter!("courier_outbox_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("courier_outbox_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish that failed after all retries.
    pub fn record_publish_failure(topic: &str) {
        counter!("courier_outbox_publish_failures_total", "topic" => topic.to_string())
            .increment(1);
    }
}

/// Inbox ingest and apply metrics recorder.
pub struct InboxMetrics;

impl InboxMetrics {
    /// Record a newly stored record.
    pub fn record_ingested() {
        counter!("courier_inbox_ingested_total").increment(1);
    }

    /// Record a redelivered record.
    pub fn record_duplicate() {
        counter!("courier_inbox_duplicates_total").increment(1);
    }

    /// Record an undecodable record.
    pub fn record_dropped() {
        counter!("courier_inbox_dropped_total").increment(1);
    }

    /// Record a failed inbox insert.
    pub fn record_ingest_failure() {
        counter!("courier_inbox_ingest_failures_total").increment(1);
    }

    /// Record a committed apply tick.
    pub fn record_applied(count: usize, duration: Duration) {
        counter!("courier_inbox_applied_total").increment(count as u64);
        histogram!("courier_inbox_apply_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an apply tick rolled back by a handler failure.
    pub fn record_apply_failure() {
        counter!("courier_inbox_apply_failures_total").increment(1);
    }
}

/// Worker loop metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record an aborted tick.
    pub fn record_tick_failure(worker: &'static str) {
        counter!("courier_worker_tick_failures_total", "worker" => worker).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("courier_retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("courier_retry_exhausted_total").increment(1);
    }
}

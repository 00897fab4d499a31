//! Worker fan-out with a shared shutdown signal.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Shortest tick period a worker loop runs with; a zero period is raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A group of spawned worker tasks sharing one shutdown signal.
///
/// Each worker gets its own `watch::Receiver<bool>`; [`WorkerSet::shutdown`]
/// flips it to `true` and waits for every task to return.
///
/// # Example
///
/// ```ignore
/// let mut workers = WorkerSet::new();
/// workers.spawn("inbox-apply", 2, move |index, shutdown| {
///     applier.clone().with_name(format!("inbox-apply-{index}")).run(shutdown)
/// });
/// workers.shutdown().await;
/// ```
#[derive(Debug)]
pub struct WorkerSet {
    handles: Vec<(String, JoinHandle<()>)>,
    shutdown: watch::Sender<bool>,
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handles: Vec::new(),
            shutdown,
        }
    }

    /// A receiver of this set's shutdown signal.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn `count` instances built by `factory(index, shutdown)`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&mut self, name: &str, count: usize, factory: F)
    where
        F: Fn(usize, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for index in 0..count {
            let handle = tokio::spawn(factory(index, self.shutdown.subscribe()));
            self.handles.push((format!("{name}-{index}"), handle));
        }
        tracing::info!(worker = name, count, "Workers spawned");
    }

    /// Number of spawned tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no task has been spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every task to finish its current step.
    ///
    /// Returns the number of tasks that had died (panicked or been
    /// cancelled) instead of returning normally.
    pub async fn shutdown(self) -> usize {
        self.shutdown.send_replace(true);
        tracing::info!(workers = self.handles.len(), "Stopping workers");

        let mut failed = 0;
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                failed += 1;
                tracing::error!(worker = %name, error = %e, "Worker task failed");
            }
        }

        tracing::info!(failed, "All workers stopped");
        failed
    }
}

/// Tick timer of a worker loop. Missed ticks are delayed, not bursted.
///
/// `tokio::time::interval` rejects a zero period, so one is raised to
/// [`MIN_PERIOD`].
pub(crate) fn ticker(worker: &str, period: Duration) -> Interval {
    if period < MIN_PERIOD {
        tracing::warn!(
            worker,
            period_ms = period.as_millis(),
            min_period_ms = MIN_PERIOD.as_millis(),
            "Tick period below minimum, raising it"
        );
    }
    let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `true` if the caller should stop.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    tokio::select! {
        () = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn shutdown_stops_every_instance() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut workers = WorkerSet::new();

        let counter = Arc::clone(&stopped);
        workers.spawn("idle", 3, move |_, mut shutdown| {
            let counter = Arc::clone(&counter);
            async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(workers.len(), 3);
        assert_eq!(workers.shutdown().await, 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn instances_get_their_index() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut workers = WorkerSet::new();

        let log = Arc::clone(&seen);
        workers.spawn("indexed", 2, move |index, _| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(index);
            }
        });
        workers.shutdown().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_ticker_runs_at_the_minimum() {
        let mut timer = ticker("test", Duration::ZERO);
        let started = tokio::time::Instant::now();

        timer.tick().await;
        timer.tick().await;
        timer.tick().await;

        assert_eq!(started.elapsed(), MIN_PERIOD * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_shutdown_reports_the_signal() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_secs(5), &mut rx).await);

        tx.send_replace(true);
        assert!(sleep_or_shutdown(Duration::from_secs(5), &mut rx).await);
    }
}

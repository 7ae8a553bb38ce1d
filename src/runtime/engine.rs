//! # Reconciliation Engine
//!
//! A work-queue-driven execution loop shared by every controller.
//!
//! The engine knows nothing about pods or clusters. It runs the configured
//! [`EventSource`]s, pulls keys from one deduplicating [`WorkQueue`] with a
//! fixed pool of workers, and applies the outcome of each reconcile:
//!
//! - `Ok(ReconcileResult::done())`: drop the key and reset its backoff
//! - `Ok(ReconcileResult::requeue_after(d))`: enqueue again after `d`
//! - `Err(e)`: ask the reconciler's [`Reconcile::error_policy`]; by default
//!   the key is re-enqueued with per-key exponential backoff
//!
//! Cancelling the token stops the sources, shuts the queue down, and waits
//! for in-flight reconciles to return.

use crate::observability::metrics;
use crate::runtime::error_policy::ErrorAction;
use crate::runtime::queue::WorkQueue;
use crate::runtime::source::EventSource;
use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Outcome of a successful reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Enqueue the key again after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing left to do for this key
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Reconcile this key again after `delay`
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// A reconcile function over keys of type `K`
#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    type Error: Display + Send;

    /// Drive the object identified by `key` towards its desired state
    async fn reconcile(
        &self,
        key: &K,
        cancel: &CancellationToken,
    ) -> Result<ReconcileResult, Self::Error>;

    /// Decide how a failed key is retried
    fn error_policy(&self, _key: &K, _error: &Self::Error) -> ErrorAction {
        ErrorAction::RateLimited
    }
}

/// Engine sizing and backoff
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// First rate-limited delay
    pub backoff_start: Duration,
    /// Cap of the rate-limited delay
    pub backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: crate::constants::DEFAULT_POD_WORKERS,
            backoff_start: Duration::from_millis(crate::constants::DEFAULT_BACKOFF_START_MS),
            backoff_max: Duration::from_millis(crate::constants::DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

/// Work-queue-driven controller runtime
pub struct Engine<K, R> {
    name: &'static str,
    queue: Arc<WorkQueue<K>>,
    reconciler: Arc<R>,
    workers: usize,
    sources: Vec<Box<dyn EventSource<K>>>,
}

impl<K, R> Debug for Engine<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl<K, R> Engine<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    R: Reconcile<K> + 'static,
{
    /// Create an engine named `name` (used in logs and metrics)
    pub fn new(name: &'static str, reconciler: Arc<R>, config: &EngineConfig) -> Self {
        Self {
            name,
            queue: Arc::new(WorkQueue::new(config.backoff_start, config.backoff_max)),
            reconciler,
            workers: config.workers.max(1),
            sources: Vec::new(),
        }
    }

    /// Add an event source
    #[must_use]
    pub fn with_source(mut self, source: Box<dyn EventSource<K>>) -> Self {
        self.sources.push(source);
        self
    }

    /// Handle to the queue, for components that enqueue directly
    pub fn queue(&self) -> Arc<WorkQueue<K>> {
        Arc::clone(&self.queue)
    }

    /// Run sources and workers until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(controller = self.name, workers = self.workers, "starting engine");

        let source_cancel = cancel.child_token();
        let sources: Vec<_> = self
            .sources
            .into_iter()
            .map(|source| tokio::spawn(source.run(Arc::clone(&self.queue), source_cancel.clone())))
            .collect();

        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let queue = Arc::clone(&self.queue);
                let reconciler = Arc::clone(&self.reconciler);
                let cancel = cancel.clone();
                tokio::spawn(worker(self.name, id, queue, reconciler, cancel))
            })
            .collect();

        cancel.cancelled().await;
        info!(controller = self.name, "shutting down engine");
        source_cancel.cancel();
        self.queue.shut_down();

        for handle in workers.into_iter().chain(sources) {
            if let Err(e) = handle.await {
                error!(controller = self.name, error = %e, "engine task failed");
            }
        }
        info!(controller = self.name, "engine stopped");
    }
}

async fn worker<K, R>(
    name: &'static str,
    id: usize,
    queue: Arc<WorkQueue<K>>,
    reconciler: Arc<R>,
    cancel: CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    R: Reconcile<K>,
{
    debug!(controller = name, worker = id, "worker started");
    while let Some(key) = queue.get().await {
        metrics::set_work_queue_depth(name, queue.len());
        process(name, &queue, reconciler.as_ref(), &key, &cancel).await;
        queue.done(&key);
    }
    debug!(controller = name, worker = id, "worker stopped");
}

async fn process<K, R>(
    name: &'static str,
    queue: &Arc<WorkQueue<K>>,
    reconciler: &R,
    key: &K,
    cancel: &CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    R: Reconcile<K>,
{
    let span = tracing::info_span!("reconcile", controller = name, key = ?key);
    let start = Instant::now();
    metrics::increment_reconciliations(name);

    let result = reconciler.reconcile(key, cancel).instrument(span).await;
    metrics::observe_reconciliation_duration(name, start.elapsed().as_secs_f64());

    match result {
        Ok(ReconcileResult {
            requeue_after: Some(delay),
        }) => {
            queue.forget(key);
            metrics::increment_requeues(name, "requeue_after");
            debug!(controller = name, ?key, ?delay, "requeue after");
            queue.add_after(key.clone(), delay);
        }
        Ok(ReconcileResult {
            requeue_after: None,
        }) => queue.forget(key),
        Err(e) => {
            metrics::increment_reconciliation_errors(name);
            match reconciler.error_policy(key, &e) {
                ErrorAction::RateLimited => {
                    metrics::increment_requeues(name, "error_backoff");
                    queue.add_rate_limited(key.clone());
                }
                ErrorAction::RequeueAfter(delay) => {
                    metrics::increment_requeues(name, "error_fixed");
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::Drop => queue.forget(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::source::ChannelSource;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails the first `fail_times` reconciles of every key, then succeeds
    #[derive(Default)]
    struct Flaky {
        fail_times: u32,
        requeue_once: bool,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl Flaky {
        fn calls(&self, key: &str) -> u32 {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconcile<String> for Flaky {
        type Error = String;

        async fn reconcile(
            &self,
            key: &String,
            _cancel: &CancellationToken,
        ) -> Result<ReconcileResult, String> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(key.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if n <= self.fail_times {
                return Err(format!("attempt {n} failed"));
            }
            if self.requeue_once && n == self.fail_times + 1 {
                return Ok(ReconcileResult::requeue_after(Duration::from_secs(10)));
            }
            Ok(ReconcileResult::done())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            backoff_start: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_retried_with_backoff() {
        let reconciler = Arc::new(Flaky {
            fail_times: 3,
            ..Default::default()
        });
        let (source, tx) = ChannelSource::new();
        let engine = Engine::new("test", Arc::clone(&reconciler), &config())
            .with_source(Box::new(source));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tx.send("default/web-1".to_string()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls("default/web-1"), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_reschedules() {
        let reconciler = Arc::new(Flaky {
            fail_times: 0,
            requeue_once: true,
            ..Default::default()
        });
        let (source, tx) = ChannelSource::new();
        let engine = Engine::new("test", Arc::clone(&reconciler), &config())
            .with_source(Box::new(source));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tx.send("k".to_string()).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reconciler.calls("k"), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(reconciler.calls("k"), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_after_cancel() {
        let reconciler = Arc::new(Flaky::default());
        let engine = Engine::new("test", reconciler, &config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        engine.run(cancel).await;
    }
}

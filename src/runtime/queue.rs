//! # Work Queue
//!
//! Deduplicating, rate-limited work queue shared by all workers of one controller.
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by a worker, or both "processing" and "dirty" when it was added
//! again while a worker held it. Repeated adds of a waiting key collapse into
//! one entry, and a key is never handed to two workers at the same time; a
//! key re-added during processing is queued again once the worker calls
//! [`WorkQueue::done`].

use crate::runtime::rate_limit::ExponentialBackoff;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    limiter: ExponentialBackoff<K>,
    shutting_down: bool,
}

/// Deduplicating work queue with delayed and rate-limited adds
#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a queue whose rate-limited adds back off from `base` up to `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                limiter: ExponentialBackoff::new(base, max),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    // A poisoned lock only means a worker panicked mid-update; the sets are still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                trace!(?key, "key is being processed, will requeue on done");
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after its per-key exponential backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.lock().limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.lock().limiter.forget(key);
    }

    /// Consecutive rate-limited adds of `key` since the last [`forget`](Self::forget)
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing; requeues it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if !state.shutting_down && state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) was called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

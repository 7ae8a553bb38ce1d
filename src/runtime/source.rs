//! # Event Sources
//!
//! Change-notification sources that feed keys into a [`WorkQueue`].
//!
//! - [`WatchSource`]: cache-backed; a kube watcher keeps a reflector store
//!   current and enqueues keys for relevant changes
//! - [`PollingSource`]: lists keys from a non-cache backend on an interval
//! - [`ChannelSource`]: forwards keys pushed by another component
//!
//! Every source stops when its cancellation token fires.

use crate::runtime::queue::WorkQueue;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{pin_mut, StreamExt};
use kube::api::Api;
use kube::Resource;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A producer of reconcile keys
#[async_trait]
pub trait EventSource<K>: Send {
    /// Feed keys into `queue` until `cancel` fires or the source is exhausted
    async fn run(self: Box<Self>, queue: Arc<WorkQueue<K>>, cancel: CancellationToken);
}

/// Maps watched objects to keys and decides which changes matter
pub trait EventFilter<T, K>: Send + Sync {
    /// Key for `obj`, or `None` when the object is never reconciled
    fn key(&self, obj: &T) -> Option<K>;

    /// Whether an update from `old` to `new` needs a reconcile
    fn on_update(&self, _old: &T, _new: &T) -> bool {
        true
    }

    /// Whether the deletion of `obj` needs a reconcile
    fn on_delete(&self, _obj: &T) -> bool {
        true
    }
}

/// Cache-backed source: one watch keeps a reflector store in sync and
/// enqueues keys for the changes the [`EventFilter`] accepts.
pub struct WatchSource<T, K>
where
    T: Resource + Clone + 'static,
    T::DynamicType: Eq + Hash + Clone,
{
    name: &'static str,
    api: Api<T>,
    config: watcher::Config,
    writer: kube_runtime::reflector::store::Writer<T>,
    filter: Arc<dyn EventFilter<T, K>>,
}

impl<T, K> Debug for WatchSource<T, K>
where
    T: Resource + Clone + 'static,
    T::DynamicType: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T, K> WatchSource<T, K>
where
    T: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
{
    /// Create a source over `api`; returns the source and a reader of its cache
    pub fn new(
        name: &'static str,
        api: Api<T>,
        config: watcher::Config,
        filter: Arc<dyn EventFilter<T, K>>,
    ) -> (Self, Store<T>) {
        let (reader, writer) = kube_runtime::reflector::store();
        (
            Self {
                name,
                api,
                config,
                writer,
                filter,
            },
            reader,
        )
    }

    fn handle(&mut self, event: watcher::Event<T>, queue: &WorkQueue<K>) {
        match &event {
            watcher::Event::Apply(obj) => {
                let old = self.writer.as_reader().get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                let relevant = old.as_deref().is_none_or(|old| self.filter.on_update(old, obj));
                if relevant {
                    self.enqueue(obj, queue);
                }
            }
            watcher::Event::InitApply(obj) => {
                self.writer.apply_watcher_event(&event);
                self.enqueue(obj, queue);
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                if self.filter.on_delete(obj) {
                    self.enqueue(obj, queue);
                }
            }
            watcher::Event::Init => self.writer.apply_watcher_event(&event),
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                info!(source = self.name, "watch cache synced");
            }
        }
    }

    fn enqueue(&self, obj: &T, queue: &WorkQueue<K>) {
        if let Some(key) = self.filter.key(obj) {
            debug!(source = self.name, ?key, "enqueue");
            queue.add(key);
        }
    }
}

#[async_trait]
impl<T, K> EventSource<K> for WatchSource<T, K>
where
    T: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
{
    async fn run(mut self: Box<Self>, queue: Arc<WorkQueue<K>>, cancel: CancellationToken) {
        info!(source = self.name, "starting watch source");
        let stream = watcher(self.api.clone(), self.config.clone()).default_backoff();
        pin_mut!(stream);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle(event, &queue),
                    // default_backoff() restarts the watch after errors
                    Some(Err(e)) => warn!(source = self.name, error = %e, "watch error"),
                    None => {
                        warn!(source = self.name, "watch stream ended");
                        break;
                    }
                },
            }
        }
        info!(source = self.name, "watch source stopped");
    }
}

/// Async listing used by [`PollingSource`]
pub type KeyLister<K> = Arc<dyn Fn() -> BoxFuture<'static, crate::Result<Vec<K>>> + Send + Sync>;

/// Polls a listing function and enqueues every key it returns
pub struct PollingSource<K> {
    name: String,
    interval: Duration,
    lister: KeyLister<K>,
}

impl<K> Debug for PollingSource<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingSource")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<K> PollingSource<K> {
    pub fn new(name: impl Into<String>, interval: Duration, lister: KeyLister<K>) -> Self {
        Self {
            name: name.into(),
            interval,
            lister,
        }
    }
}

#[async_trait]
impl<K> EventSource<K> for PollingSource<K>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
{
    async fn run(self: Box<Self>, queue: Arc<WorkQueue<K>>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match (self.lister)().await {
                        Ok(keys) => {
                            debug!(source = %self.name, count = keys.len(), "poll");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                        Err(e) => warn!(source = %self.name, error = %e, "poll failed"),
                    }
                }
            }
        }
        debug!(source = %self.name, "polling source stopped");
    }
}

/// Forwards keys pushed through an mpsc channel
#[derive(Debug)]
pub struct ChannelSource<K> {
    rx: mpsc::UnboundedReceiver<K>,
}

impl<K> ChannelSource<K> {
    /// Create a source and the sender that feeds it
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedSender<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }
}

#[async_trait]
impl<K> EventSource<K> for ChannelSource<K>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
{
    async fn run(mut self: Box<Self>, queue: Arc<WorkQueue<K>>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                key = self.rx.recv() => match key {
                    Some(key) => queue.add(key),
                    None => break,
                },
            }
        }
    }
}

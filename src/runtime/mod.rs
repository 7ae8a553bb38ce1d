//! # Runtime
//!
//! The reusable controller runtime and process bootstrap.
//!
//! - `engine`: worker pool and the `Reconcile` contract
//! - `queue`: deduplicating work queue
//! - `rate_limit`: per-key exponential backoff
//! - `source`: watch, polling and channel event sources
//! - `error_policy`: error classification for requeues
//! - `initialization`: process bootstrap

pub mod engine;
pub mod error_policy;
pub mod initialization;
pub mod queue;
pub mod rate_limit;
pub mod source;

pub use engine::{Engine, EngineConfig, Reconcile, ReconcileResult};
pub use error_policy::ErrorAction;
pub use queue::WorkQueue;
pub use source::{ChannelSource, EventFilter, EventSource, PollingSource, WatchSource};

//! # Exponential Backoff
//!
//! Per-key exponential backoff for failed reconciles.
//!
//! Each key keeps its own failure count, so one misbehaving object does not
//! slow down the others. The delay doubles with every consecutive failure
//! and is capped at the configured maximum:
//!
//! ```rust
//! use clustertree_controller::runtime::rate_limit::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut limiter = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
//! assert_eq!(limiter.when(&"default/web-1"), Duration::from_millis(5));
//! assert_eq!(limiter.when(&"default/web-1"), Duration::from_millis(10));
//! assert_eq!(limiter.when(&"default/web-1"), Duration::from_millis(20));
//! limiter.forget(&"default/web-1");
//! assert_eq!(limiter.when(&"default/web-1"), Duration::from_millis(5));
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Exponential backoff calculator keyed by work item
#[derive(Debug, Clone)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Hash + Eq + Clone> ExponentialBackoff<K> {
    /// Create a limiter starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        // 2^31 * base overflows long before the cap matters
        if exponent >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of consecutive failures recorded for `key`
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count for `key` after a success
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

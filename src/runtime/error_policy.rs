//! # Error Policy
//!
//! Maps reconcile errors to a retry decision for the engine.

use crate::config::ControllerConfig;
use crate::Error;
use std::time::Duration;
use tracing::{error, warn};

/// How the engine re-enqueues a failed key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Per-key exponential backoff
    RateLimited,
    /// Fixed delay, independent of the failure count
    RequeueAfter(Duration),
    /// Do not retry
    Drop,
}

/// Classify a projection error
///
/// Transient failures back off exponentially. Permanent ones (naming
/// collisions, missing backend capabilities, malformed objects) are logged
/// at error level and retried on the long permanent interval so they stay
/// visible without hammering the API.
pub fn classify(key: &str, err: &Error, config: &ControllerConfig) -> ErrorAction {
    if err.is_transient() {
        warn!(key, error = %err, kind = err.kind(), "reconcile failed, retrying with backoff");
        ErrorAction::RateLimited
    } else {
        error!(
            key,
            error = %err,
            kind = err.kind(),
            requeue_secs = config.permanent_error_requeue_secs,
            "reconcile failed permanently"
        );
        ErrorAction::RequeueAfter(config.permanent_error_requeue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_back_off() {
        let config = ControllerConfig::default();
        let action = classify(
            "default/web-1",
            &Error::LeafNotRegistered("leafA".into()),
            &config,
        );
        assert_eq!(action, ErrorAction::RateLimited);
    }

    #[test]
    fn permanent_errors_use_fixed_interval() {
        let config = ControllerConfig::default();
        let action = classify(
            "default/web-1",
            &Error::NotImplemented {
                backend: "serverless",
                operation: "update",
            },
            &config,
        );
        assert_eq!(
            action,
            ErrorAction::RequeueAfter(Duration::from_secs(config.permanent_error_requeue_secs))
        );
    }
}

//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `clustertree_reconciliations_total` - Reconciliations by controller
//! - `clustertree_reconciliation_errors_total` - Failed reconciliations by controller
//! - `clustertree_reconciliation_duration_seconds` - Duration of reconciliations
//! - `clustertree_requeues_total` - Requeues by controller and reason
//! - `clustertree_work_queue_depth` - Keys waiting in each controller's queue
//! - `clustertree_leaf_operations_total` - Writes issued against leaf backends
//! - `clustertree_registered_leaves` - Leaf clusters currently registered

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "clustertree_reconciliations_total",
            "Total number of reconciliations by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "clustertree_reconciliation_errors_total",
            "Total number of failed reconciliations by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "clustertree_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "clustertree_requeues_total",
            "Total number of requeues by controller and reason",
        ),
        &["controller", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static WORK_QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "clustertree_work_queue_depth",
            "Number of keys waiting in the work queue",
        ),
        &["controller"],
    )
    .expect("Failed to create WORK_QUEUE_DEPTH metric - this should never happen")
});

static LEAF_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "clustertree_leaf_operations_total",
            "Total number of write operations issued against leaf backends",
        ),
        &["cluster", "verb", "resource"],
    )
    .expect("Failed to create LEAF_OPERATIONS_TOTAL metric - this should never happen")
});

static REGISTERED_LEAVES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "clustertree_registered_leaves",
        "Number of leaf clusters currently registered",
    )
    .expect("Failed to create REGISTERED_LEAVES metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORK_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(LEAF_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTERED_LEAVES.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors(controller: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_requeues(controller: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).inc();
}

pub fn set_work_queue_depth(controller: &str, depth: usize) {
    WORK_QUEUE_DEPTH
        .with_label_values(&[controller])
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Count a write issued against a leaf (`verb` is create/update/delete)
pub fn record_leaf_operation(cluster: &str, verb: &str, resource: &str) {
    LEAF_OPERATIONS_TOTAL
        .with_label_values(&[cluster, verb, resource])
        .inc();
}

pub fn set_registered_leaves(count: usize) {
    REGISTERED_LEAVES.set(i64::try_from(count).unwrap_or(i64::MAX));
}

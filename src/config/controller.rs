//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Command-line flags parsed in `main` take precedence over both.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Restrict the root pod watch to a single namespace (all namespaces when `None`)
    pub watch_namespace: Option<String>,
    /// Namespace whose pods are never projected
    pub reserved_namespace: String,
    /// Prefix of virtual root nodes that stand for leaves
    pub node_prefix: String,
    /// Pod reconcile worker count
    pub pod_workers: usize,
    /// Cluster registration concurrency
    pub cluster_workers: usize,
    /// Convert automounted ServiceAccount tokens into a leaf-local projection
    pub enable_service_account: bool,
    /// Labels stripped from leaf copies and round-tripped through an annotation
    pub ignore_labels: Vec<String>,
    /// Point `ClusterFirst` pods at the root cluster's DNS service
    pub root_coredns: bool,
    /// Root DNS service as `namespace/name`
    pub root_coredns_service: String,
    /// Fixed requeue while a node is not yet claimed by a leaf (seconds)
    pub leaf_not_ready_requeue_secs: u64,
    /// Requeue interval for permanent errors (seconds)
    pub permanent_error_requeue_secs: u64,
    /// Per-key exponential backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Per-key exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Poll interval while waiting for dependents in the root cache (milliseconds)
    pub dependency_poll_interval_ms: u64,
    /// ConfigMap materialization ceiling (seconds)
    pub configmap_timeout_secs: u64,
    /// Secret materialization ceiling (seconds)
    pub secret_timeout_secs: u64,
    /// PersistentVolumeClaim materialization ceiling (seconds)
    pub pvc_timeout_secs: u64,
    /// Serverless instance polling interval (seconds)
    pub serverless_poll_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            watch_namespace: None,
            reserved_namespace: DEFAULT_RESERVED_NAMESPACE.to_string(),
            node_prefix: DEFAULT_NODE_PREFIX.to_string(),
            pod_workers: DEFAULT_POD_WORKERS,
            cluster_workers: DEFAULT_CLUSTER_WORKERS,
            enable_service_account: false,
            ignore_labels: Vec::new(),
            root_coredns: false,
            root_coredns_service: DEFAULT_ROOT_COREDNS_SERVICE.to_string(),
            leaf_not_ready_requeue_secs: DEFAULT_LEAF_NOT_READY_REQUEUE_SECS,
            permanent_error_requeue_secs: DEFAULT_PERMANENT_ERROR_REQUEUE_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            dependency_poll_interval_ms: DEFAULT_DEPENDENCY_POLL_INTERVAL_MS,
            configmap_timeout_secs: DEFAULT_CONFIGMAP_TIMEOUT_SECS,
            secret_timeout_secs: DEFAULT_SECRET_TIMEOUT_SECS,
            pvc_timeout_secs: DEFAULT_PVC_TIMEOUT_SECS,
            serverless_poll_secs: DEFAULT_SERVERLESS_POLL_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
            reserved_namespace: env_var_or_default_str(
                "RESERVED_NAMESPACE",
                DEFAULT_RESERVED_NAMESPACE,
            ),
            node_prefix: env_var_or_default_str("NODE_PREFIX", DEFAULT_NODE_PREFIX),
            pod_workers: env_var_or_default("POD_WORKERS", DEFAULT_POD_WORKERS),
            cluster_workers: env_var_or_default("CLUSTER_WORKERS", DEFAULT_CLUSTER_WORKERS),
            enable_service_account: env_var_or_default_bool("ENABLE_SERVICE_ACCOUNT", false),
            ignore_labels: parse_label_list(&env_var_or_default_str("IGNORE_LABELS", "")),
            root_coredns: env_var_or_default_bool("ROOT_COREDNS", false),
            root_coredns_service: env_var_or_default_str(
                "ROOT_COREDNS_SERVICE",
                DEFAULT_ROOT_COREDNS_SERVICE,
            ),
            leaf_not_ready_requeue_secs: env_var_or_default(
                "LEAF_NOT_READY_REQUEUE_SECS",
                DEFAULT_LEAF_NOT_READY_REQUEUE_SECS,
            ),
            permanent_error_requeue_secs: env_var_or_default(
                "PERMANENT_ERROR_REQUEUE_SECS",
                DEFAULT_PERMANENT_ERROR_REQUEUE_SECS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            dependency_poll_interval_ms: env_var_or_default(
                "DEPENDENCY_POLL_INTERVAL_MS",
                DEFAULT_DEPENDENCY_POLL_INTERVAL_MS,
            ),
            configmap_timeout_secs: env_var_or_default(
                "CONFIGMAP_TIMEOUT_SECS",
                DEFAULT_CONFIGMAP_TIMEOUT_SECS,
            ),
            secret_timeout_secs: env_var_or_default(
                "SECRET_TIMEOUT_SECS",
                DEFAULT_SECRET_TIMEOUT_SECS,
            ),
            pvc_timeout_secs: env_var_or_default("PVC_TIMEOUT_SECS", DEFAULT_PVC_TIMEOUT_SECS),
            serverless_poll_secs: env_var_or_default(
                "SERVERLESS_POLL_SECS",
                DEFAULT_SERVERLESS_POLL_SECS,
            ),
        }
    }

    /// Get the requeue used while a node's leaf is not registered yet
    pub fn leaf_not_ready_requeue(&self) -> Duration {
        Duration::from_secs(self.leaf_not_ready_requeue_secs)
    }

    /// Get the requeue used for permanent errors
    pub fn permanent_error_requeue(&self) -> Duration {
        Duration::from_secs(self.permanent_error_requeue_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get serverless polling interval
    pub fn serverless_poll_interval(&self) -> Duration {
        Duration::from_secs(self.serverless_poll_secs)
    }

    /// Parse the root DNS service reference into `(namespace, name)`
    pub fn root_coredns_service_ref(&self) -> Option<(&str, &str)> {
        self.root_coredns_service
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
    }
}

/// Split a comma separated label list, dropping blanks
pub fn parse_label_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_list_drops_blanks() {
        assert_eq!(
            parse_label_list(" app , ,tier,"),
            vec!["app".to_string(), "tier".to_string()]
        );
        assert!(parse_label_list("").is_empty());
    }

    #[test]
    fn coredns_reference_requires_both_parts() {
        let mut config = ControllerConfig::default();
        assert_eq!(
            config.root_coredns_service_ref(),
            Some(("kube-system", "kube-dns"))
        );
        config.root_coredns_service = "kube-dns".into();
        assert_eq!(config.root_coredns_service_ref(), None);
        config.root_coredns_service = "/kube-dns".into();
        assert_eq!(config.root_coredns_service_ref(), None);
    }
}

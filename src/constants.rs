//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Namespace the control plane itself runs in. Pods here are never projected.
pub const DEFAULT_RESERVED_NAMESPACE: &str = "kosmos-system";

/// Prefix of the virtual nodes in the root cluster that stand for leaves
pub const DEFAULT_NODE_PREFIX: &str = "kosmos-";

/// Default number of pod reconcile workers
pub const DEFAULT_POD_WORKERS: usize = 4;

/// Default number of concurrent cluster registrations
pub const DEFAULT_CLUSTER_WORKERS: usize = 2;

/// Fixed requeue while a pod's node is not yet claimed by a registered leaf (seconds)
pub const DEFAULT_LEAF_NOT_READY_REQUEUE_SECS: u64 = 10;

/// Requeue interval for permanent errors (naming collisions, missing capabilities)
pub const DEFAULT_PERMANENT_ERROR_REQUEUE_SECS: u64 = 300;

/// Per-key exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 5;

/// Per-key exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Poll interval while waiting for a dependent object to show up in the root cache
pub const DEFAULT_DEPENDENCY_POLL_INTERVAL_MS: u64 = 500;

/// Ceiling for ConfigMap materialization (seconds)
pub const DEFAULT_CONFIGMAP_TIMEOUT_SECS: u64 = 10;

/// Ceiling for Secret materialization (seconds)
pub const DEFAULT_SECRET_TIMEOUT_SECS: u64 = 10;

/// Ceiling for PersistentVolumeClaim materialization (seconds)
pub const DEFAULT_PVC_TIMEOUT_SECS: u64 = 30;

/// Poll interval of the serverless instance listing (seconds)
pub const DEFAULT_SERVERLESS_POLL_SECS: u64 = 15;

/// Label stamped on every leaf pod created by the controller
pub const POD_LABEL_KEY: &str = "kosmos-io/pod";

/// Label stamped on every dependent object created in a leaf
pub const MANAGED_LABEL_KEY: &str = "kosmos-io/managed";

/// Annotation that carries labels stripped from the leaf copy (JSON object)
pub const IGNORED_LABELS_ANNOTATION: &str = "kosmos-io/ignored-labels";

/// Annotation that allows a DaemonSet-owned pod to be projected
pub const DAEMONSET_ALLOW_ANNOTATION: &str = "kosmos-io/daemonset-allow";

/// Label used to correlate serverless instances with their order
pub const ORDER_ID_LABEL: &str = "kosmos-io/order-id";

/// Labels used to correlate serverless instances with their root pod
pub const ORDER_NAMESPACE_LABEL: &str = "kosmos-io/pod-namespace";
pub const ORDER_NAME_LABEL: &str = "kosmos-io/pod-name";

/// Root CA ConfigMap published by every cluster
pub const ROOT_CA_CONFIGMAP: &str = "kube-root-ca.crt";

/// Name the root CA ConfigMap gets inside a leaf
pub const LEAF_ROOT_CA_CONFIGMAP: &str = "master-root-ca.crt";

/// Secret type of legacy ServiceAccount token secrets
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Annotations binding a token secret to its ServiceAccount
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
pub const SERVICE_ACCOUNT_UID_ANNOTATION: &str = "kubernetes.io/service-account.uid";

/// Annotation the storage provisioner reads to bind a claim to a node
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Volume name prefixes that reference root-only credentials
pub const DEFAULT_TOKEN_VOLUME_PREFIX: &str = "default-token-";
pub const KUBE_API_ACCESS_VOLUME_PREFIX: &str = "kube-api-access-";

/// Mount path of the in-pod ServiceAccount credentials
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Lifetime requested for projected ServiceAccount tokens (seconds)
pub const SERVICE_ACCOUNT_TOKEN_EXPIRATION_SECS: i64 = 3607;

/// Default root DNS service (`namespace/name`)
pub const DEFAULT_ROOT_COREDNS_SERVICE: &str = "kube-system/kube-dns";

/// Finalizer placed on Cluster resources so removal is observed
pub const CLUSTER_FINALIZER: &str = "kosmos.io/cluster-tree";

/// Field manager used for server-side operations
pub const FIELD_MANAGER: &str = "clustertree-controller";

//! # Errors
//!
//! Error taxonomy for pod projection.
//!
//! Every failure falls into one of a few classes that decide how the engine
//! retries it:
//!
//! - transient backend failures (API errors, unregistered leaves, timeouts)
//!   are requeued with exponential backoff;
//! - not-found on delete/get paths never surfaces here, callers map it to success;
//! - naming collisions and missing backend capabilities are permanent and
//!   requeued at a long fixed interval so they stay visible;
//! - missing mandatory dependencies are requeued at normal backoff because
//!   the referenced object may appear later.

use thiserror::Error;

/// Main error type for projection operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (root or leaf)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A cluster name that is not (or no longer) in the registry
    #[error("leaf cluster {0} is not registered")]
    LeafNotRegistered(String),

    /// A node name that no registered leaf claims
    #[error("node {0} is not claimed by any registered leaf")]
    NodeNotFound(String),

    /// Create raced with another writer; callers verify ownership
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// An object with the projected identity exists but is not managed by us
    #[error("{kind} {namespace}/{name} exists in leaf {cluster} but is not managed by kosmos")]
    NamingCollision {
        cluster: String,
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// A mandatory ConfigMap/Secret/PVC reference cannot be resolved
    #[error("missing {kind} {namespace}/{name}")]
    MissingDependency {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// A dependent object did not appear before its polling ceiling
    #[error("timed out waiting for {kind} {namespace}/{name}")]
    DependencyTimeout {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// One or more dependency classes failed during pod create
    #[error("dependency projection failed: {}", join_errors(.0))]
    Dependencies(Vec<Error>),

    /// The backend does not support the requested verb
    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    /// Transport error talking to a serverless backend
    #[error("serverless backend error: {0}")]
    Serverless(#[from] reqwest::Error),

    /// Serverless backend rejected a request
    #[error("serverless backend returned {status}: {message}")]
    ServerlessApi { status: u16, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A leaf kubeconfig could not be parsed or turned into a client
    #[error("invalid kubeconfig for leaf {cluster}: {message}")]
    InvalidKubeconfig { cluster: String, message: String },

    /// An object is missing fields every live object has
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// The surrounding context was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an invalid object error with the given message
    pub fn invalid_object(msg: impl Into<String>) -> Self {
        Self::InvalidObject(msg.into())
    }

    /// Whether retrying with backoff can resolve this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NamingCollision { .. }
            | Self::NotImplemented { .. }
            | Self::InvalidKubeconfig { .. }
            | Self::InvalidObject(_) => false,
            Self::Dependencies(errors) => errors.iter().all(Error::is_transient),
            _ => true,
        }
    }

    /// Short label used for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::LeafNotRegistered(_) => "leaf_not_registered",
            Self::NodeNotFound(_) => "node_not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::NamingCollision { .. } => "naming_collision",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::DependencyTimeout { .. } => "dependency_timeout",
            Self::Dependencies(_) => "dependencies",
            Self::NotImplemented { .. } => "not_implemented",
            Self::Serverless(_) | Self::ServerlessApi { .. } => "serverless",
            Self::Serialization(_) => "serialization",
            Self::InvalidKubeconfig { .. } => "invalid_kubeconfig",
            Self::InvalidObject(_) => "invalid_object",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this is a kube API 404
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

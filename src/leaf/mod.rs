//! # Leaf Clusters
//!
//! Connection bundles for the clusters pods are projected into.
//!
//! A [`LeafResource`] is built once when a cluster registers. It owns the
//! backend connection and the [`PodSyncer`] strategy for that backend, so
//! code that projects pods never has to look at the backend kind.
//!
//! - `registry`: the concurrency-safe catalog of registered leaves
//! - `client`: object verbs against a native leaf API server
//! - `serverless`: order/instance API of serverless backends

pub mod client;
pub mod registry;
pub mod serverless;

pub use client::{KubeLeafClient, LeafClient};
pub use registry::LeafResourceRegistry;
pub use serverless::{HttpServerlessApi, ServerlessApi};

use crate::podsync::native::NativePodSyncer;
use crate::podsync::serverless::ServerlessPodSyncer;
use crate::podsync::PodSyncer;
use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How root nodes map onto leaf nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafMode {
    /// One root node stands for exactly one leaf node
    Node,
    /// One root node stands for a pool of leaf nodes picked by a selector
    Party,
}

/// Backend family of a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Serverless,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Serverless => "serverless",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A root node claimed by a leaf
///
/// In `Node` mode the root node and the leaf node share one name.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    /// Node name as seen in the root cluster
    pub node_name: String,
    /// Owning leaf cluster
    pub cluster_name: String,
    pub mode: LeafMode,
    /// Leaf nodes eligible to run pods of this root node (`Party` mode)
    pub selector: Option<LabelSelector>,
}

impl ClusterNode {
    /// A `Node`-mode entry for the leaf node `node_name`
    pub fn node(node_name: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            cluster_name: cluster_name.into(),
            mode: LeafMode::Node,
            selector: None,
        }
    }

    /// A `Party`-mode entry whose pods are pinned by `selector`
    pub fn party(
        node_name: impl Into<String>,
        cluster_name: impl Into<String>,
        selector: Option<LabelSelector>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            cluster_name: cluster_name.into(),
            mode: LeafMode::Party,
            selector,
        }
    }
}

/// Transport to a leaf backend
#[derive(Clone)]
pub enum LeafConnection {
    /// A Kubernetes API server
    Native { client: Arc<dyn LeafClient> },
    /// An external compute API
    Serverless { api: Arc<dyn ServerlessApi> },
}

impl fmt::Debug for LeafConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafConnection")
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

impl LeafConnection {
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Native { .. } => BackendKind::Native,
            Self::Serverless { .. } => BackendKind::Serverless,
        }
    }
}

/// Per-leaf projection switches
#[derive(Debug, Clone, Default)]
pub struct LeafOptions {
    /// Labels removed from leaf copies and kept in the trip-wire annotation
    pub ignore_labels: Vec<String>,
    /// Replace automounted root tokens with a leaf-local projection
    pub enable_service_account: bool,
    /// Fingerprint of the credentials the connection was built from
    pub fingerprint: Option<String>,
}

/// One registered leaf cluster
pub struct LeafResource {
    cluster_name: String,
    connection: LeafConnection,
    options: LeafOptions,
    pod_syncer: Arc<dyn PodSyncer>,
    /// Set once the registry drops this entry
    retired: AtomicBool,
}

impl fmt::Debug for LeafResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafResource")
            .field("cluster_name", &self.cluster_name)
            .field("backend", &self.backend())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LeafResource {
    /// Build a leaf and the pod syncer for its backend
    pub fn new(
        cluster_name: impl Into<String>,
        connection: LeafConnection,
        options: LeafOptions,
    ) -> Self {
        let cluster_name = cluster_name.into();
        let pod_syncer: Arc<dyn PodSyncer> = match &connection {
            LeafConnection::Native { client } => Arc::new(NativePodSyncer::new(
                cluster_name.clone(),
                Arc::clone(client),
                options.clone(),
            )),
            LeafConnection::Serverless { api } => Arc::new(ServerlessPodSyncer::new(
                cluster_name.clone(),
                Arc::clone(api),
                options.clone(),
            )),
        };
        Self {
            cluster_name,
            connection,
            options,
            pod_syncer,
            retired: AtomicBool::new(false),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.connection.backend()
    }

    pub fn options(&self) -> &LeafOptions {
        &self.options
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.options.fingerprint.as_deref()
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Fail with [`Error::LeafNotRegistered`] once this entry left the registry
    ///
    /// Work that resolved the leaf before it was removed checks this before
    /// writing, so it never acts through a stale connection.
    pub fn ensure_registered(&self) -> Result<()> {
        if self.retired.load(Ordering::Acquire) {
            return Err(Error::LeafNotRegistered(self.cluster_name.clone()));
        }
        Ok(())
    }

    /// Strategy projecting pods into this leaf
    pub fn pod_syncer(&self) -> Arc<dyn PodSyncer> {
        Arc::clone(&self.pod_syncer)
    }

    /// Serverless API, if this leaf is a serverless backend
    pub fn serverless_api(&self) -> Option<Arc<dyn ServerlessApi>> {
        match &self.connection {
            LeafConnection::Serverless { api } => Some(Arc::clone(api)),
            LeafConnection::Native { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::serverless::MockServerlessApi;

    #[test]
    fn test_connection_debug_names_backend() {
        let connection = LeafConnection::Serverless {
            api: Arc::new(MockServerlessApi::new()),
        };
        assert_eq!(
            format!("{connection:?}"),
            "LeafConnection { backend: Serverless, .. }"
        );
    }
}

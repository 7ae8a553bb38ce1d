//! # Leaf Resource Registry
//!
//! In-memory catalog of registered leaves and the root nodes they claim.
//!
//! Writers take the lock exclusively, readers share it. The lock is never
//! held across I/O: lookups hand out `Arc` clones and callers do their
//! network calls after the guard is dropped. Lookups of unknown clusters or
//! nodes fail with [`Error::LeafNotRegistered`] / [`Error::NodeNotFound`],
//! both of which the error policy treats as transient.

use crate::leaf::{ClusterNode, LeafResource};
use crate::observability::metrics;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

#[derive(Default)]
struct Inner {
    clusters: HashMap<String, Arc<LeafResource>>,
    /// Root node name -> node entry; every entry's cluster is in `clusters`
    nodes: HashMap<String, ClusterNode>,
}

/// Concurrency-safe map of leaf cluster name to connection bundle
#[derive(Default)]
pub struct LeafResourceRegistry {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for LeafResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("LeafResourceRegistry")
            .field("clusters", &inner.clusters.len())
            .field("nodes", &inner.nodes.len())
            .finish()
    }
}

impl LeafResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a panic happened while holding it; the maps
    // themselves are always left consistent, so recover the guard.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a leaf and the root nodes it claims
    ///
    /// Replaces any previous registration under the same cluster name,
    /// including the nodes that registration claimed.
    pub fn add_leaf_resource(&self, resource: Arc<LeafResource>, nodes: Vec<ClusterNode>) {
        let cluster = resource.cluster_name().to_string();
        let (count, replaced) = {
            let mut inner = self.write();
            inner.nodes.retain(|_, node| node.cluster_name != cluster);
            for mut node in nodes {
                if node.cluster_name != cluster {
                    warn!(
                        cluster = %cluster,
                        node = %node.node_name,
                        claimed_by = %node.cluster_name,
                        "node entry names another cluster, re-homing it"
                    );
                    node.cluster_name.clone_from(&cluster);
                }
                inner.nodes.insert(node.node_name.clone(), node);
            }
            let replaced = inner.clusters.insert(cluster.clone(), resource);
            (inner.clusters.len(), replaced)
        };
        if let Some(old) = replaced {
            old.retire();
        }
        metrics::set_registered_leaves(count);
        info!(cluster = %cluster, "registered leaf cluster");
    }

    /// Drop a leaf and every node it claimed
    ///
    /// Returns the removed entry so the caller can release its connection.
    pub fn remove_leaf_resource(&self, cluster_name: &str) -> Option<Arc<LeafResource>> {
        let (removed, count) = {
            let mut inner = self.write();
            let removed = inner.clusters.remove(cluster_name);
            inner.nodes.retain(|_, node| node.cluster_name != cluster_name);
            (removed, inner.clusters.len())
        };
        metrics::set_registered_leaves(count);
        if let Some(old) = &removed {
            old.retire();
            info!(cluster = %cluster_name, "removed leaf cluster");
        }
        removed
    }

    pub fn get_leaf_resource(&self, cluster_name: &str) -> Result<Arc<LeafResource>> {
        self.read()
            .clusters
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| Error::LeafNotRegistered(cluster_name.to_string()))
    }

    /// Leaf owning the root node `node_name`
    pub fn get_leaf_resource_by_node_name(&self, node_name: &str) -> Result<Arc<LeafResource>> {
        let inner = self.read();
        let node = inner
            .nodes
            .get(node_name)
            .ok_or_else(|| Error::NodeNotFound(node_name.to_string()))?;
        inner
            .clusters
            .get(&node.cluster_name)
            .cloned()
            .ok_or_else(|| Error::LeafNotRegistered(node.cluster_name.clone()))
    }

    pub fn get_cluster_node(&self, node_name: &str) -> Result<ClusterNode> {
        self.read()
            .nodes
            .get(node_name)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_name.to_string()))
    }

    /// Resolve a root node to its node entry and owning leaf in one lookup
    pub fn resolve_node(&self, node_name: &str) -> Result<(ClusterNode, Arc<LeafResource>)> {
        let inner = self.read();
        let node = inner
            .nodes
            .get(node_name)
            .ok_or_else(|| Error::NodeNotFound(node_name.to_string()))?;
        let resource = inner
            .clusters
            .get(&node.cluster_name)
            .cloned()
            .ok_or_else(|| Error::LeafNotRegistered(node.cluster_name.clone()))?;
        Ok((node.clone(), resource))
    }

    pub fn has_cluster(&self, cluster_name: &str) -> bool {
        self.read().clusters.contains_key(cluster_name)
    }

    pub fn has_node(&self, node_name: &str) -> bool {
        self.read().nodes.contains_key(node_name)
    }

    /// Every claimed root node name, sorted
    pub fn list_nodes(&self) -> Vec<String> {
        self.read()
            .nodes
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every registered cluster name, sorted
    pub fn list_clusters(&self) -> Vec<String> {
        self.read()
            .clusters
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Snapshot of every registered leaf
    pub fn leaf_resources(&self) -> Vec<Arc<LeafResource>> {
        self.read().clusters.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::serverless::MockServerlessApi;
    use crate::leaf::{LeafConnection, LeafMode, LeafOptions};

    fn leaf(name: &str) -> Arc<LeafResource> {
        Arc::new(LeafResource::new(
            name,
            LeafConnection::Serverless {
                api: Arc::new(MockServerlessApi::new()),
            },
            LeafOptions::default(),
        ))
    }

    #[test]
    fn test_nodes_resolve_to_their_leaf() {
        let registry = LeafResourceRegistry::new();
        let nodes = vec![
            ClusterNode::node("kosmos-leafA-node1", "leafA"),
            ClusterNode::node("kosmos-leafA-node2", "leafA"),
        ];
        registry.add_leaf_resource(leaf("leafA"), nodes.clone());

        for node in &nodes {
            let resource = registry
                .get_leaf_resource_by_node_name(&node.node_name)
                .unwrap();
            assert_eq!(resource.cluster_name(), "leafA");
            assert_eq!(
                registry.get_cluster_node(&node.node_name).unwrap().mode,
                LeafMode::Node
            );
        }
        assert_eq!(
            registry.list_nodes(),
            vec!["kosmos-leafA-node1", "kosmos-leafA-node2"]
        );
        assert!(registry.has_cluster("leafA"));
    }

    #[test]
    fn test_remove_makes_lookups_fail() {
        let registry = LeafResourceRegistry::new();
        registry.add_leaf_resource(
            leaf("leafA"),
            vec![ClusterNode::party("kosmos-leafA", "leafA", None)],
        );
        assert!(registry.remove_leaf_resource("leafA").is_some());

        assert!(matches!(
            registry.get_leaf_resource_by_node_name("kosmos-leafA"),
            Err(Error::NodeNotFound(_))
        ));
        assert!(matches!(
            registry.get_leaf_resource("leafA"),
            Err(Error::LeafNotRegistered(_))
        ));
        assert!(!registry.has_node("kosmos-leafA"));
        assert!(registry.list_clusters().is_empty());
    }

    #[test]
    fn test_removed_leaf_refuses_work() {
        let registry = LeafResourceRegistry::new();
        let held = leaf("leafA");
        registry.add_leaf_resource(Arc::clone(&held), Vec::new());
        assert!(held.ensure_registered().is_ok());

        registry.remove_leaf_resource("leafA");
        assert!(matches!(
            held.ensure_registered(),
            Err(Error::LeafNotRegistered(_))
        ));
    }

    #[test]
    fn test_replaced_leaf_refuses_work() {
        let registry = LeafResourceRegistry::new();
        let old = leaf("leafA");
        registry.add_leaf_resource(Arc::clone(&old), Vec::new());
        registry.add_leaf_resource(leaf("leafA"), Vec::new());
        assert!(old.ensure_registered().is_err());
        assert!(registry
            .get_leaf_resource("leafA")
            .unwrap()
            .ensure_registered()
            .is_ok());
    }

    #[test]
    fn test_lookup_before_registration_is_transient() {
        let registry = LeafResourceRegistry::new();
        let err = registry.get_cluster_node("kosmos-leafB").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_reregistration_replaces_nodes() {
        let registry = LeafResourceRegistry::new();
        registry.add_leaf_resource(
            leaf("leafA"),
            vec![ClusterNode::node("kosmos-leafA-old", "leafA")],
        );
        registry.add_leaf_resource(
            leaf("leafA"),
            vec![ClusterNode::node("kosmos-leafA-new", "leafA")],
        );
        assert_eq!(registry.list_nodes(), vec!["kosmos-leafA-new"]);
        assert_eq!(registry.list_clusters(), vec!["leafA"]);
    }

    #[test]
    fn test_node_entries_are_rehomed_to_registering_cluster() {
        let registry = LeafResourceRegistry::new();
        registry.add_leaf_resource(
            leaf("leafA"),
            vec![ClusterNode::node("kosmos-x", "leafB")],
        );
        let (node, resource) = registry.resolve_node("kosmos-x").unwrap();
        assert_eq!(node.cluster_name, "leafA");
        assert_eq!(resource.cluster_name(), "leafA");
    }
}

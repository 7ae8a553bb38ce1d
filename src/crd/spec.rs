//! # Cluster Spec
//!
//! The `Cluster` resource registers a leaf with the control plane.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

/// Cluster Custom Resource Definition
///
/// One `Cluster` per leaf. Either `kubeconfig` or `serverless` must be set.
///
/// # Example
///
/// ```yaml
/// apiVersion: kosmos.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: leafA
/// spec:
///   kubeconfig: <base64 kubeconfig>
///   clusterTreeOptions:
///     enable: true
///     leafModels:
///       - nodeSelector:
///           nodeName: kosmos-leafA-node1
///       - leafNodeName: kosmos-leafA-gpu
///         nodeSelector:
///           labelSelector:
///             matchLabels:
///               gpu: "true"
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "kosmos.io",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubeconfig of the leaf, base64 encoded
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub kubeconfig: Option<ByteString>,
    /// Serverless backend, used instead of `kubeconfig`
    #[serde(default)]
    pub serverless: Option<ServerlessSpec>,
    #[serde(default)]
    pub cluster_tree_options: ClusterTreeOptions,
}

/// Pod projection settings of a leaf
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTreeOptions {
    /// Project pods into this leaf
    #[serde(default = "crate::crd::spec::default_true")]
    pub enable: bool,
    /// Root nodes this leaf claims; empty means one pooled node
    #[serde(default)]
    pub leaf_models: Vec<LeafModel>,
}

impl Default for ClusterTreeOptions {
    fn default() -> Self {
        Self {
            enable: true,
            leaf_models: Vec::new(),
        }
    }
}

/// A root node backed by this leaf
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeafModel {
    /// Root node name of a label-selected pool; defaults to `<prefix><cluster>`.
    /// A `nodeName` model always uses the leaf node's own name.
    #[serde(default)]
    pub leaf_node_name: Option<String>,
    #[serde(default)]
    pub node_selector: NodeSelector,
}

/// How pods of a leaf model are placed in the leaf
///
/// `nodeName` pins to one leaf node (node mode). `labelSelector` targets a
/// pool of leaf nodes (party mode).
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<serde_json::Value>")]
    pub label_selector: Option<LabelSelector>,
}

/// External compute API reached instead of a Kubernetes API server
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessSpec {
    /// Base URL of the backend API
    pub endpoint: String,
    /// Secret holding the bearer token
    #[serde(default)]
    pub token_secret_ref: Option<SecretKeyRef>,
}

/// Reference to one key of a Secret
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    #[serde(default = "crate::crd::spec::default_token_key")]
    pub key: String,
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_token_key() -> String {
    "token".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_options_missing() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "kubeconfig": "YXBpVmVyc2lvbjogdjE="
        }))
        .unwrap();
        assert_eq!(spec.kubeconfig.unwrap().0, b"apiVersion: v1");
        assert!(spec.cluster_tree_options.enable);
        assert!(spec.cluster_tree_options.leaf_models.is_empty());
    }

    #[test]
    fn test_leaf_models_decode() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterTreeOptions": {
                "leafModels": [
                    {"leafNodeName": "kosmos-leafA-node1", "nodeSelector": {"nodeName": "node1"}},
                    {"leafNodeName": "kosmos-leafA-gpu", "nodeSelector": {"labelSelector": {"matchLabels": {"gpu": "true"}}}}
                ]
            }
        }))
        .unwrap();
        let models = &spec.cluster_tree_options.leaf_models;
        assert_eq!(models[0].node_selector.node_name.as_deref(), Some("node1"));
        assert!(models[1].node_selector.label_selector.is_some());
    }

    #[test]
    fn test_serverless_token_key_defaults() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "serverless": {
                "endpoint": "https://compute.example.com",
                "tokenSecretRef": {"name": "compute-token", "namespace": "kosmos-system"}
            }
        }))
        .unwrap();
        assert_eq!(spec.serverless.unwrap().token_secret_ref.unwrap().key, "token");
    }
}

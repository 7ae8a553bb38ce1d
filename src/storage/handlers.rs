//! Per-kind preparation of a dependent object before it is created in a leaf.
//!
//! Handlers only shape the object (and, for ServiceAccount tokens, make
//! sure the account exists). Whether the object already exists in the leaf
//! is checked by the caller before a handler runs.

use crate::constants::{
    LEAF_ROOT_CA_CONFIGMAP, MANAGED_LABEL_KEY, ROOT_CA_CONFIGMAP, SELECTED_NODE_ANNOTATION,
    SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_TYPE, SERVICE_ACCOUNT_UID_ANNOTATION,
};
use crate::leaf::{ClusterNode, LeafClient, LeafMode};
use crate::storage::{ProjectedObject, ResourceClass};
use crate::{Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Name a root object gets inside a leaf
pub(crate) fn leaf_name(class: ResourceClass, root_name: &str) -> &str {
    match (class, root_name) {
        (ResourceClass::ConfigMap, ROOT_CA_CONFIGMAP) => LEAF_ROOT_CA_CONFIGMAP,
        _ => root_name,
    }
}

impl ProjectedObject {
    /// Prepare this object for creation in the leaf behind `client`
    pub async fn before_create_in_leaf(
        &mut self,
        client: &dyn LeafClient,
        cluster: &str,
        root_pod: &Pod,
        node: &ClusterNode,
    ) -> Result<()> {
        match self {
            Self::ConfigMap(cm) => {
                config_map_before_create(cm);
                Ok(())
            }
            Self::Secret(secret) => secret_before_create(secret, client, cluster).await,
            Self::PersistentVolumeClaim(pvc) => {
                pvc_before_create(pvc, root_pod, node);
                Ok(())
            }
        }
    }
}

fn config_map_before_create(cm: &mut ConfigMap) {
    if cm.metadata.name.as_deref() == Some(ROOT_CA_CONFIGMAP) {
        cm.metadata.name = Some(LEAF_ROOT_CA_CONFIGMAP.to_string());
    }
}

async fn secret_before_create(
    secret: &mut Secret,
    client: &dyn LeafClient,
    cluster: &str,
) -> Result<()> {
    if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        return Ok(());
    }
    let namespace = secret
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid_object("token secret without a namespace"))?;
    let Some(account) = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
        .cloned()
    else {
        debug!(cluster, namespace = %namespace, "token secret names no ServiceAccount");
        return Ok(());
    };

    let leaf_account = ensure_service_account(client, cluster, &namespace, &account).await?;
    let uid = leaf_account.metadata.uid.ok_or_else(|| {
        Error::invalid_object(format!(
            "ServiceAccount {namespace}/{account} in leaf {cluster} has no uid"
        ))
    })?;
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SERVICE_ACCOUNT_UID_ANNOTATION.to_string(), uid);
    Ok(())
}

async fn ensure_service_account(
    client: &dyn LeafClient,
    cluster: &str,
    namespace: &str,
    name: &str,
) -> Result<ServiceAccount> {
    if let Some(existing) = client.get_service_account(namespace, name).await? {
        return Ok(existing);
    }

    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_LABEL_KEY.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    match client.create_service_account(&account).await {
        Ok(created) => {
            info!(cluster, namespace, name, "created ServiceAccount in leaf");
            Ok(created)
        }
        Err(Error::AlreadyExists { .. }) => client
            .get_service_account(namespace, name)
            .await?
            .ok_or_else(|| Error::MissingDependency {
                kind: "ServiceAccount",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        Err(e) => Err(e),
    }
}

fn pvc_before_create(pvc: &mut PersistentVolumeClaim, root_pod: &Pod, node: &ClusterNode) {
    let annotations = pvc.metadata.annotations.get_or_insert_with(BTreeMap::new);
    match node.mode {
        LeafMode::Node => {
            if let Some(node_name) = root_pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                annotations.insert(SELECTED_NODE_ANNOTATION.to_string(), node_name);
            }
        }
        // the root's selection names a root node that no leaf node matches
        LeafMode::Party => {
            annotations.remove(SELECTED_NODE_ANNOTATION);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    fn root_pod(node: &str) -> Pod {
        Pod {
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pvc() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                namespace: Some("default".into()),
                annotations: Some(BTreeMap::from([(
                    SELECTED_NODE_ANNOTATION.to_string(),
                    "root-node".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_root_ca_is_renamed() {
        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(ROOT_CA_CONFIGMAP.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        config_map_before_create(&mut cm);
        assert_eq!(cm.metadata.name.as_deref(), Some(LEAF_ROOT_CA_CONFIGMAP));
        // second call leaves the object unchanged
        config_map_before_create(&mut cm);
        assert_eq!(cm.metadata.name.as_deref(), Some(LEAF_ROOT_CA_CONFIGMAP));
        assert_eq!(
            leaf_name(ResourceClass::ConfigMap, ROOT_CA_CONFIGMAP),
            LEAF_ROOT_CA_CONFIGMAP
        );
        assert_eq!(leaf_name(ResourceClass::Secret, ROOT_CA_CONFIGMAP), ROOT_CA_CONFIGMAP);
    }

    #[test]
    fn test_pvc_node_mode_selects_root_node() {
        let mut claim = pvc();
        let node = ClusterNode::node("kosmos-leafA-node1", "leafA");
        pvc_before_create(&mut claim, &root_pod("kosmos-leafA-node1"), &node);
        assert_eq!(
            claim.metadata.annotations.unwrap()[SELECTED_NODE_ANNOTATION],
            "kosmos-leafA-node1"
        );
    }

    #[test]
    fn test_pvc_party_mode_drops_selection() {
        let mut claim = pvc();
        let node = ClusterNode::party("kosmos-leafA", "leafA", None);
        pvc_before_create(&mut claim, &root_pod("kosmos-leafA"), &node);
        assert!(!claim
            .metadata
            .annotations
            .unwrap()
            .contains_key(SELECTED_NODE_ANNOTATION));
    }
}

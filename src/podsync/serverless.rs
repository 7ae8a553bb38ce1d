//! Pod projection into a serverless backend.
//!
//! Each root pod becomes one order. Orders are found again through the
//! root pod's namespace and name, which are submitted as order labels; the
//! order id itself is random and only used to cancel the order.

use crate::constants::{ORDER_ID_LABEL, ORDER_NAMESPACE_LABEL, ORDER_NAME_LABEL};
use crate::env::resolver::resolve_pod_env;
use crate::leaf::serverless::{Instance, InstancePhase, OrderRequest, ServerlessApi};
use crate::leaf::{BackendKind, ClusterNode, LeafOptions};
use crate::podsync::translate::{build_leaf_pod, restore_leaf_pod, strip_root_credentials};
use crate::podsync::{PodSyncer, ProjectionContext};
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// [`PodSyncer`] over a [`ServerlessApi`]
pub struct ServerlessPodSyncer {
    cluster_name: String,
    api: Arc<dyn ServerlessApi>,
    options: LeafOptions,
}

impl std::fmt::Debug for ServerlessPodSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerlessPodSyncer")
            .field("cluster_name", &self.cluster_name)
            .finish_non_exhaustive()
    }
}

/// Labels identifying the order of root pod `namespace/name`
pub fn correlation_labels(namespace: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ORDER_NAMESPACE_LABEL.to_string(), namespace.to_string()),
        (ORDER_NAME_LABEL.to_string(), name.to_string()),
    ])
}

/// Root pod key an instance belongs to, from its correlation labels
pub fn instance_pod_key(instance: &Instance) -> Option<(String, String)> {
    Some((
        instance.labels.get(ORDER_NAMESPACE_LABEL)?.clone(),
        instance.labels.get(ORDER_NAME_LABEL)?.clone(),
    ))
}

fn phase_name(phase: InstancePhase) -> &'static str {
    match phase {
        InstancePhase::Pending => "Pending",
        InstancePhase::Running => "Running",
        InstancePhase::Succeeded => "Succeeded",
        InstancePhase::Failed => "Failed",
        InstancePhase::Unknown => "Unknown",
    }
}

/// The submitted pod with the backend's view of its status
fn instance_pod(instance: Instance) -> Pod {
    let mut pod = restore_leaf_pod(instance.pod);
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(phase_name(instance.phase).to_string());
    if instance.pod_ip.is_some() {
        status.pod_ip = instance.pod_ip;
    }
    if instance.message.is_some() {
        status.message = instance.message;
    }
    pod
}

impl ServerlessPodSyncer {
    pub fn new(cluster_name: String, api: Arc<dyn ServerlessApi>, options: LeafOptions) -> Self {
        Self {
            cluster_name,
            api,
            options,
        }
    }
}

#[async_trait]
impl PodSyncer for ServerlessPodSyncer {
    fn backend(&self) -> BackendKind {
        BackendKind::Serverless
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let instances = self
            .api
            .find_instances(&correlation_labels(namespace, name))
            .await?;
        Ok(instances.into_iter().next().map(instance_pod))
    }

    async fn create(&self, ctx: &ProjectionContext, root: &Pod, node: &ClusterNode) -> Result<()> {
        let namespace = root
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::invalid_object("pod without a namespace"))?;
        let name = root
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_object("pod without a name"))?;

        let correlation = correlation_labels(namespace, name);
        if !self.api.find_instances(&correlation).await?.is_empty() {
            debug!(cluster = %self.cluster_name, namespace, name, "order already submitted");
            return Ok(());
        }

        let mut pod = build_leaf_pod(root, node, &self.options.ignore_labels);
        // the backend has no API server to authenticate against
        strip_root_credentials(&mut pod, true);
        resolve_pod_env(&mut pod, ctx.root.as_ref())?;

        let order_id = uuid::Uuid::new_v4().to_string();
        let mut labels = correlation;
        labels.insert(ORDER_ID_LABEL.to_string(), order_id.clone());

        let instance = self
            .api
            .create_order(&OrderRequest {
                order_id,
                labels,
                pod,
            })
            .await?;
        info!(
            cluster = %self.cluster_name,
            namespace,
            name,
            order_id = %instance.order_id,
            "submitted serverless order"
        );
        Ok(())
    }

    async fn update(&self, _ctx: &ProjectionContext, _root: &Pod, _leaf: &Pod) -> Result<()> {
        Err(Error::NotImplemented {
            backend: BackendKind::Serverless.as_str(),
            operation: "update",
        })
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        let instances = self
            .api
            .find_instances(&correlation_labels(namespace, name))
            .await?;
        for instance in instances {
            self.api.delete_order(&instance.order_id).await?;
            info!(
                cluster = %self.cluster_name,
                namespace,
                name,
                order_id = %instance.order_id,
                "cancelled serverless order"
            );
        }
        Ok(())
    }
}

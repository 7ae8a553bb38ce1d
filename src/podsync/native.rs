//! Pod projection into a Kubernetes leaf.
//!
//! Create path, in order:
//! 1. translate the root pod (labels, credentials, placement)
//! 2. resolve `envFrom`/`valueFrom` against the root cache
//! 3. ensure the namespace exists in the leaf
//! 4. optionally convert the ServiceAccount token and redirect DNS
//! 5. materialise ConfigMaps, Secrets and PVCs concurrently
//! 6. create the pod
//!
//! Auth conversion runs before the fan-out because the generated token
//! projection references the renamed root CA ConfigMap. Auth and DNS
//! failures are logged and the pod is created without them; dependency
//! failures block the create.

use crate::constants::MANAGED_LABEL_KEY;
use crate::env::resolver::resolve_pod_env;
use crate::env::RootStore;
use crate::leaf::{BackendKind, ClusterNode, LeafClient, LeafOptions};
use crate::podsync::translate::{
    apply_root_changes, build_leaf_pod, convert_service_account_auth, is_kosmos_pod,
    redirect_dns, restore_leaf_pod,
};
use crate::podsync::{PodSyncer, ProjectionContext};
use crate::storage::{materialize_dependents, DependentSet, FanoutSettings};
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// [`PodSyncer`] over a [`LeafClient`]
pub struct NativePodSyncer {
    cluster_name: String,
    client: Arc<dyn LeafClient>,
    options: LeafOptions,
}

impl std::fmt::Debug for NativePodSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePodSyncer")
            .field("cluster_name", &self.cluster_name)
            .finish_non_exhaustive()
    }
}

fn managed_meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(
            MANAGED_LABEL_KEY.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    }
}

impl NativePodSyncer {
    pub fn new(cluster_name: String, client: Arc<dyn LeafClient>, options: LeafOptions) -> Self {
        Self {
            cluster_name,
            client,
            options,
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.client.get_namespace(namespace).await?.is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: managed_meta(None, namespace),
            ..Default::default()
        };
        match self.client.create_namespace(&ns).await {
            Ok(_) => {
                info!(cluster = %self.cluster_name, namespace, "created namespace in leaf");
                Ok(())
            }
            // another worker won the race
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        if self.client.get_service_account(namespace, name).await?.is_some() {
            return Ok(());
        }
        let account = ServiceAccount {
            metadata: managed_meta(Some(namespace), name),
            ..Default::default()
        };
        match self.client.create_service_account(&account).await {
            Ok(_) | Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Leaf-local token projection; failures leave the pod unconverted
    async fn convert_auth(&self, pod: &mut Pod, namespace: &str) {
        let account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| "default".to_string());
        match self.ensure_service_account(namespace, &account).await {
            Ok(()) => {
                if convert_service_account_auth(pod) {
                    debug!(cluster = %self.cluster_name, namespace, account = %account, "converted service account token");
                }
            }
            Err(e) => warn!(
                cluster = %self.cluster_name,
                namespace,
                account = %account,
                error = %e,
                "service account conversion failed, creating pod without it"
            ),
        }
    }

    fn redirect_dns(&self, ctx: &ProjectionContext, pod: &mut Pod) {
        let Some((dns_namespace, dns_name)) = ctx.config.root_coredns_service_ref() else {
            warn!(service = %ctx.config.root_coredns_service, "invalid root DNS service reference");
            return;
        };
        let ip = ctx
            .root
            .get_service(dns_namespace, dns_name)
            .and_then(|svc| svc.spec.as_ref()?.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None");
        match ip {
            Some(ip) => {
                redirect_dns(pod, &ip);
            }
            None => warn!(
                cluster = %self.cluster_name,
                service = %ctx.config.root_coredns_service,
                "root DNS service has no cluster IP, keeping leaf DNS"
            ),
        }
    }

    fn pod_collision(&self, namespace: &str, name: &str) -> Error {
        Error::NamingCollision {
            cluster: self.cluster_name.clone(),
            kind: "Pod",
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    async fn verify_existing(&self, namespace: &str, name: &str) -> Result<()> {
        match self.client.get_pod(namespace, name).await? {
            Some(existing) if is_kosmos_pod(&existing) => {
                debug!(cluster = %self.cluster_name, namespace, name, "leaf pod already exists");
                Ok(())
            }
            Some(_) => Err(self.pod_collision(namespace, name)),
            // deleted between the conflict and the read; the next reconcile retries
            None => Err(Error::AlreadyExists {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

#[async_trait]
impl PodSyncer for NativePodSyncer {
    fn backend(&self) -> BackendKind {
        BackendKind::Native
    }

    /// Unmanaged same-named pods are reported as absent; creating over them
    /// then fails with a naming collision instead of overwriting them.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .client
            .get_pod(namespace, name)
            .await?
            .filter(is_kosmos_pod)
            .map(restore_leaf_pod))
    }

    async fn create(&self, ctx: &ProjectionContext, root: &Pod, node: &ClusterNode) -> Result<()> {
        let namespace = root
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::invalid_object("pod without a namespace"))?;
        let name = root
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid_object("pod without a name"))?;

        // nothing is written into the leaf while a same-named pod blocks the name
        match self.client.get_pod(&namespace, &name).await? {
            Some(existing) if is_kosmos_pod(&existing) => {
                debug!(cluster = %self.cluster_name, namespace = %namespace, name = %name, "leaf pod already exists");
                return Ok(());
            }
            Some(_) => return Err(self.pod_collision(&namespace, &name)),
            None => {}
        }

        let mut pod = build_leaf_pod(root, node, &self.options.ignore_labels);
        resolve_pod_env(&mut pod, ctx.root.as_ref())?;
        self.ensure_namespace(&namespace).await?;

        if self.options.enable_service_account {
            self.convert_auth(&mut pod, &namespace).await;
        }
        if ctx.config.root_coredns {
            self.redirect_dns(ctx, &mut pod);
        }

        let dependents = DependentSet::from_pod(&pod);
        if !dependents.is_empty() {
            let root_store: &dyn RootStore = ctx.root.as_ref();
            materialize_dependents(
                self.client.as_ref(),
                &self.cluster_name,
                root_store,
                root,
                node,
                &dependents,
                &FanoutSettings::from_config(&ctx.config),
                &ctx.cancel,
            )
            .await?;
        }

        match self.client.create_pod(&pod).await {
            Ok(_) => {
                info!(cluster = %self.cluster_name, namespace = %namespace, name = %name, "created pod in leaf");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => self.verify_existing(&namespace, &name).await,
            Err(e) => Err(e),
        }
    }

    async fn update(&self, _ctx: &ProjectionContext, root: &Pod, leaf: &Pod) -> Result<()> {
        let updated = apply_root_changes(leaf, root, &self.options.ignore_labels);
        self.client.update_pod(&updated).await?;
        info!(
            cluster = %self.cluster_name,
            namespace = root.metadata.namespace.as_deref().unwrap_or_default(),
            name = root.metadata.name.as_deref().unwrap_or_default(),
            "updated pod in leaf"
        );
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        match self.client.get_pod(namespace, name).await? {
            None => Ok(()),
            Some(existing) if !is_kosmos_pod(&existing) => {
                warn!(cluster = %self.cluster_name, namespace, name, "leaf pod is not managed by kosmos, not deleting");
                Ok(())
            }
            Some(_) => {
                self.client
                    .delete_pod(namespace, name, grace_period_seconds)
                    .await?;
                info!(cluster = %self.cluster_name, namespace, name, ?grace_period_seconds, "deleted pod in leaf");
                Ok(())
            }
        }
    }
}

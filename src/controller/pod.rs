//! # Root Pod Reconciler
//!
//! Drives the leaf copy of every root pod bound to a leaf-backed node.
//!
//! The lifecycle is an ordered decision list evaluated on each reconcile:
//!
//! 1. root pod gone: sweep a same-named copy from every leaf
//! 2. root pod not scheduled yet: wait
//! 3. node not claimed by a registered leaf: requeue after a fixed delay
//! 4. root pod terminating: delete the leaf copy, then release the root pod
//! 5. leaf copy missing: create it
//! 6. leaf copy drifted: update it
//!
//! [`decide`] encodes the list as a pure function; [`RootPodReconciler`]
//! gathers its inputs and executes the result.

use crate::config::SharedControllerConfig;
use crate::constants::DAEMONSET_ALLOW_ANNOTATION;
use crate::env::RootStore;
use crate::leaf::{ClusterNode, LeafResourceRegistry};
use crate::podsync::drift::{needs_update, should_enqueue};
use crate::podsync::serverless::instance_pod_key;
use crate::podsync::ProjectionContext;
use crate::runtime::error_policy::classify;
use crate::runtime::source::{EventFilter, KeyLister};
use crate::runtime::{ErrorAction, Reconcile, ReconcileResult};
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams};
use kube::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconcile key of a root pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of `pod`, if it has both a namespace and a name
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        Some(Self::new(
            pod.metadata.namespace.as_deref()?,
            pod.metadata.name.as_deref()?,
        ))
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the root cluster says about a pod
#[derive(Debug, Clone, Copy)]
pub enum RootPodState<'a> {
    Absent,
    Unscheduled,
    /// Bound to a node no registered leaf claims yet
    Unclaimed,
    Live(&'a Pod),
    Terminating(&'a Pod),
}

impl<'a> RootPodState<'a> {
    /// Classify `pod`; `claimed` says whether its node resolves to a leaf
    pub fn of(pod: Option<&'a Pod>, claimed: bool) -> Self {
        let Some(pod) = pod else {
            return Self::Absent;
        };
        let bound = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| !n.is_empty());
        if !bound {
            Self::Unscheduled
        } else if !claimed {
            Self::Unclaimed
        } else if pod.metadata.deletion_timestamp.is_some() {
            Self::Terminating(pod)
        } else {
            Self::Live(pod)
        }
    }
}

/// Next step for a root pod key
#[derive(Debug, Clone, PartialEq)]
pub enum PodAction {
    /// Delete a same-named copy from every registered leaf
    DeleteEverywhere,
    Noop,
    /// Wait for the node's leaf to register
    WaitForLeaf,
    DeleteLeaf { grace_period_seconds: Option<i64> },
    /// Force-delete the terminating root pod; its leaf copy is gone
    ReleaseRoot,
    Create,
    Update,
}

/// Decide what to do for a root pod given its leaf copy
///
/// `leaf` is only consulted for `Live` and `Terminating` root pods.
pub fn decide(root: RootPodState<'_>, leaf: Option<&Pod>) -> PodAction {
    match root {
        RootPodState::Absent => PodAction::DeleteEverywhere,
        RootPodState::Unscheduled => PodAction::Noop,
        RootPodState::Unclaimed => PodAction::WaitForLeaf,
        RootPodState::Terminating(pod) => match leaf {
            Some(_) => PodAction::DeleteLeaf {
                grace_period_seconds: pod.metadata.deletion_grace_period_seconds,
            },
            None => PodAction::ReleaseRoot,
        },
        RootPodState::Live(pod) => match leaf {
            None => PodAction::Create,
            Some(leaf) if needs_update(pod, leaf) => PodAction::Update,
            Some(_) => PodAction::Noop,
        },
    }
}

/// Writes against root pods
#[async_trait]
pub trait RootPodClient: Send + Sync {
    /// Delete a pod with grace period zero; a missing pod is not an error
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`RootPodClient`] over the root cluster API
#[derive(Clone)]
pub struct KubeRootPodClient {
    client: Client,
}

impl fmt::Debug for KubeRootPodClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeRootPodClient").finish_non_exhaustive()
    }
}

impl KubeRootPodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RootPodClient for KubeRootPodClient {
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reconciler for [`PodKey`]s
pub struct RootPodReconciler {
    registry: Arc<LeafResourceRegistry>,
    root: Arc<dyn RootStore>,
    root_pods: Arc<dyn RootPodClient>,
    config: SharedControllerConfig,
}

impl fmt::Debug for RootPodReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootPodReconciler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl RootPodReconciler {
    pub fn new(
        registry: Arc<LeafResourceRegistry>,
        root: Arc<dyn RootStore>,
        root_pods: Arc<dyn RootPodClient>,
        config: SharedControllerConfig,
    ) -> Self {
        Self {
            registry,
            root,
            root_pods,
            config,
        }
    }

    fn context(&self, cancel: &CancellationToken) -> ProjectionContext {
        ProjectionContext {
            root: Arc::clone(&self.root),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
        }
    }

    /// Delete `key` from every leaf; the owning leaf is unknown once the root pod is gone
    async fn sweep(&self, key: &PodKey) -> Result<()> {
        let mut first_error = None;
        for leaf in self.registry.leaf_resources() {
            if let Err(e) = leaf
                .pod_syncer()
                .delete(&key.namespace, &key.name, None)
                .await
            {
                warn!(cluster = leaf.cluster_name(), %key, error = %e, "failed to delete leaf pod");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Reconcile<PodKey> for RootPodReconciler {
    type Error = Error;

    async fn reconcile(
        &self,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileResult> {
        let root_pod = self.root.get_pod(&key.namespace, &key.name);
        let node_name = root_pod
            .as_ref()
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.node_name.clone());
        let target = node_name
            .as_deref()
            .map(|node| self.registry.resolve_node(node));

        let state = match &target {
            Some(Ok(_)) => RootPodState::of(root_pod.as_deref(), true),
            _ => RootPodState::of(root_pod.as_deref(), false),
        };

        let (node, leaf, leaf_pod) = match (state, target) {
            (RootPodState::Live(_) | RootPodState::Terminating(_), Some(Ok((node, leaf)))) => {
                leaf.ensure_registered()?;
                let leaf_pod = leaf.pod_syncer().get(&key.namespace, &key.name).await?;
                (Some(node), Some(leaf), leaf_pod)
            }
            (RootPodState::Unclaimed, Some(Err(e))) => {
                debug!(%key, reason = %e, "node not claimed by a registered leaf");
                (None, None, None)
            }
            _ => (None, None, None),
        };

        let action = decide(state, leaf_pod.as_ref());
        debug!(%key, ?action, "decided");

        match action {
            PodAction::Noop => Ok(ReconcileResult::done()),
            PodAction::WaitForLeaf => Ok(ReconcileResult::requeue_after(
                self.config.leaf_not_ready_requeue(),
            )),
            PodAction::DeleteEverywhere => {
                self.sweep(key).await?;
                Ok(ReconcileResult::done())
            }
            PodAction::ReleaseRoot => {
                self.root_pods
                    .force_delete_pod(&key.namespace, &key.name)
                    .await?;
                info!(%key, "released terminating root pod");
                Ok(ReconcileResult::done())
            }
            PodAction::DeleteLeaf {
                grace_period_seconds,
            } => {
                let leaf = leaf.ok_or_else(|| Error::invalid_object("leaf vanished"))?;
                leaf.pod_syncer()
                    .delete(&key.namespace, &key.name, grace_period_seconds)
                    .await?;
                // come back once the leaf pod is gone to release the root pod
                Ok(ReconcileResult::requeue_after(release_delay(
                    grace_period_seconds,
                    self.config.leaf_not_ready_requeue(),
                )))
            }
            PodAction::Create => {
                let (Some(leaf), Some(node), Some(root_pod)) = (leaf, node, root_pod) else {
                    return Err(Error::invalid_object("create without a target"));
                };
                leaf.pod_syncer()
                    .create(&self.context(cancel), &root_pod, &node)
                    .await?;
                Ok(ReconcileResult::done())
            }
            PodAction::Update => {
                let (Some(leaf), Some(root_pod), Some(leaf_pod)) = (leaf, root_pod, leaf_pod)
                else {
                    return Err(Error::invalid_object("update without a leaf pod"));
                };
                leaf.pod_syncer()
                    .update(&self.context(cancel), &root_pod, &leaf_pod)
                    .await?;
                Ok(ReconcileResult::done())
            }
        }
    }

    fn error_policy(&self, key: &PodKey, error: &Error) -> ErrorAction {
        classify(&key.to_string(), error, &self.config)
    }
}

/// Wait before checking that a deleted leaf pod is gone
///
/// The leaf needs up to the grace period; a zero or missing grace period
/// falls back to `fallback`.
pub fn release_delay(grace_period_seconds: Option<i64>, fallback: Duration) -> Duration {
    grace_period_seconds
        .and_then(|secs| u64::try_from(secs).ok())
        .filter(|secs| *secs > 0)
        .map_or(fallback, Duration::from_secs)
}

/// Selects which root pod events reach the queue
#[derive(Debug)]
pub struct RootPodEventFilter {
    registry: Arc<LeafResourceRegistry>,
    reserved_namespace: String,
    node_prefix: String,
}

impl RootPodEventFilter {
    pub fn new(registry: Arc<LeafResourceRegistry>, config: &SharedControllerConfig) -> Self {
        Self {
            registry,
            reserved_namespace: config.reserved_namespace.clone(),
            node_prefix: config.node_prefix.clone(),
        }
    }

    fn is_leaf_node(&self, node_name: &str) -> bool {
        self.registry.has_node(node_name) || node_name.starts_with(&self.node_prefix)
    }
}

/// DaemonSet pods stay in the root unless explicitly allowed
fn is_excluded_daemonset_pod(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == "DaemonSet");
    let allowed = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(DAEMONSET_ALLOW_ANNOTATION));
    owned_by_daemonset && !allowed
}

impl EventFilter<Pod, PodKey> for RootPodEventFilter {
    fn key(&self, pod: &Pod) -> Option<PodKey> {
        let key = PodKey::from_pod(pod)?;
        if key.namespace == self.reserved_namespace || is_excluded_daemonset_pod(pod) {
            return None;
        }
        let node_name = pod.spec.as_ref()?.node_name.as_deref()?;
        self.is_leaf_node(node_name).then_some(key)
    }

    fn on_update(&self, old: &Pod, new: &Pod) -> bool {
        should_enqueue(old, new)
    }
}

/// Keys of every root pod a serverless leaf still runs an order for
pub fn serverless_instance_lister(registry: Arc<LeafResourceRegistry>) -> KeyLister<PodKey> {
    Arc::new(move || {
        let registry = Arc::clone(&registry);
        Box::pin(async move {
            let mut keys = Vec::new();
            for leaf in registry.leaf_resources() {
                let Some(api) = leaf.serverless_api() else {
                    continue;
                };
                match api.list_instances().await {
                    Ok(instances) => keys.extend(
                        instances
                            .iter()
                            .filter_map(instance_pod_key)
                            .map(|(ns, name)| PodKey::new(ns, name)),
                    ),
                    Err(e) => {
                        warn!(cluster = leaf.cluster_name(), error = %e, "failed to list serverless instances");
                    }
                }
            }
            Ok(keys)
        })
    })
}

/// Root pods currently bound to one of `nodes`
pub fn pods_on_nodes<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    nodes: &[ClusterNode],
) -> Vec<PodKey> {
    pods.into_iter()
        .filter(|pod| {
            let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
            node.is_some_and(|n| nodes.iter().any(|cn| cn.node_name == n))
        })
        .filter_map(PodKey::from_pod)
        .collect()
}

//! # Cluster Registration
//!
//! Turns `Cluster` resources into registry entries.
//!
//! On apply the leaf's credentials and leaf models are fingerprinted. An
//! unchanged fingerprint is a no-op; anything else replaces the registration
//! with a fresh connection, and root pods already bound to the claimed nodes
//! are pushed to the pod queue. On deletion the finalizer removes the entry.

use crate::config::SharedControllerConfig;
use crate::constants::CLUSTER_FINALIZER;
use crate::controller::pod::{pods_on_nodes, PodKey};
use crate::crd::{Cluster, ClusterSpec, ClusterTreeOptions, SecretKeyRef};
use crate::leaf::{
    ClusterNode, HttpServerlessApi, KubeLeafClient, LeafConnection, LeafOptions, LeafResource,
    LeafResourceRegistry,
};
use crate::observability::metrics;
use crate::{Error, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerRunConfig};
use kube_runtime::finalizer::{finalizer, Event as Finalizer};
use kube_runtime::reflector::Store;
use kube_runtime::{watcher, Controller};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const CONTROLLER_NAME: &str = "cluster";

/// Errors surfaced by the cluster controller
pub type ClusterError = kube_runtime::finalizer::Error<Error>;

/// Shared state of the cluster controller
pub struct ClusterContext {
    client: Client,
    registry: Arc<LeafResourceRegistry>,
    config: SharedControllerConfig,
    /// Root pod cache, used to requeue pods of newly registered nodes
    pods: Store<Pod>,
    pod_keys: UnboundedSender<PodKey>,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ClusterContext {
    pub fn new(
        client: Client,
        registry: Arc<LeafResourceRegistry>,
        config: SharedControllerConfig,
        pods: Store<Pod>,
        pod_keys: UnboundedSender<PodKey>,
    ) -> Self {
        Self {
            client,
            registry,
            config,
            pods,
            pod_keys,
        }
    }
}

/// Root nodes a leaf claims
///
/// A model with `nodeName` claims that node 1:1. A model with
/// `labelSelector` claims a pooled node. No models claim one pooled node
/// named `<prefix><cluster>` spanning the whole leaf.
pub fn cluster_nodes(
    cluster_name: &str,
    options: &ClusterTreeOptions,
    node_prefix: &str,
) -> Vec<ClusterNode> {
    let pooled_name = || format!("{node_prefix}{cluster_name}");
    if options.leaf_models.is_empty() {
        return vec![ClusterNode::party(pooled_name(), cluster_name, None)];
    }
    options
        .leaf_models
        .iter()
        .map(|model| match &model.node_selector.node_name {
            Some(node_name) => ClusterNode::node(node_name.clone(), cluster_name),
            None => ClusterNode::party(
                model.leaf_node_name.clone().unwrap_or_else(pooled_name),
                cluster_name,
                model.node_selector.label_selector.clone(),
            ),
        })
        .collect()
}

/// SHA-256 over the leaf credentials and its leaf models
pub fn fingerprint(credentials: &[u8], options: &ClusterTreeOptions) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(credentials);
    hasher.update(serde_json::to_vec(&options.leaf_models)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Credentials of a leaf before a connection is built from them
enum Credentials {
    Kubeconfig(Vec<u8>),
    Serverless {
        endpoint: String,
        token: Option<String>,
    },
}

impl Credentials {
    fn material(&self) -> Vec<u8> {
        match self {
            Self::Kubeconfig(bytes) => bytes.clone(),
            Self::Serverless { endpoint, token } => {
                format!("{endpoint}\n{}", token.as_deref().unwrap_or_default()).into_bytes()
            }
        }
    }

    async fn connect(self, cluster_name: &str) -> Result<LeafConnection> {
        Ok(match self {
            Self::Kubeconfig(bytes) => LeafConnection::Native {
                client: Arc::new(KubeLeafClient::from_kubeconfig(cluster_name, &bytes).await?),
            },
            Self::Serverless { endpoint, token } => LeafConnection::Serverless {
                api: Arc::new(HttpServerlessApi::new(endpoint, token)?),
            },
        })
    }
}

async fn read_token(client: &Client, secret_ref: &SecretKeyRef) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let missing = || Error::MissingDependency {
        kind: "Secret",
        namespace: secret_ref.namespace.clone(),
        name: secret_ref.name.clone(),
    };
    let secret = secrets.get_opt(&secret_ref.name).await?.ok_or_else(missing)?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&secret_ref.key))
        .ok_or_else(missing)?;
    String::from_utf8(bytes.0.clone())
        .map(|token| token.trim().to_string())
        .map_err(|e| Error::invalid_object(format!("token in secret {}: {e}", secret_ref.name)))
}

async fn load_credentials(client: &Client, name: &str, spec: &ClusterSpec) -> Result<Credentials> {
    if let Some(serverless) = &spec.serverless {
        let token = match &serverless.token_secret_ref {
            Some(secret_ref) => Some(read_token(client, secret_ref).await?),
            None => None,
        };
        return Ok(Credentials::Serverless {
            endpoint: serverless.endpoint.clone(),
            token,
        });
    }
    spec.kubeconfig
        .as_ref()
        .map(|kubeconfig| Credentials::Kubeconfig(kubeconfig.0.clone()))
        .ok_or_else(|| {
            Error::invalid_object(format!("cluster {name} has neither kubeconfig nor serverless"))
        })
}

async fn apply(cluster: Arc<Cluster>, ctx: &ClusterContext) -> Result<Action> {
    let name = cluster.name_any();
    let options = &cluster.spec.cluster_tree_options;

    if !options.enable {
        if ctx.registry.remove_leaf_resource(&name).is_some() {
            info!(cluster = %name, "pod projection disabled, leaf unregistered");
        }
        return Ok(Action::await_change());
    }

    let credentials = load_credentials(&ctx.client, &name, &cluster.spec).await?;
    let fingerprint = fingerprint(&credentials.material(), options)?;
    if let Ok(existing) = ctx.registry.get_leaf_resource(&name) {
        if existing.fingerprint() == Some(fingerprint.as_str()) {
            debug!(cluster = %name, "registration unchanged");
            return Ok(Action::await_change());
        }
        info!(cluster = %name, "credentials or leaf models changed, re-registering");
    }

    let connection = credentials.connect(&name).await?;
    let nodes = cluster_nodes(&name, options, &ctx.config.node_prefix);
    let leaf_options = LeafOptions {
        ignore_labels: ctx.config.ignore_labels.clone(),
        enable_service_account: ctx.config.enable_service_account,
        fingerprint: Some(fingerprint),
    };
    let resource = Arc::new(LeafResource::new(name.clone(), connection, leaf_options));
    info!(
        cluster = %name,
        backend = %resource.backend(),
        nodes = nodes.len(),
        "registering leaf"
    );

    let pods = ctx.pods.state();
    let waiting = pods_on_nodes(pods.iter().map(|pod| &**pod), &nodes);
    ctx.registry.add_leaf_resource(resource, nodes);

    for key in waiting {
        if ctx.pod_keys.send(key).is_err() {
            warn!(cluster = %name, "pod queue closed, not requeueing bound pods");
            break;
        }
    }
    Ok(Action::await_change())
}

fn cleanup(cluster: &Cluster, ctx: &ClusterContext) -> Action {
    let name = cluster.name_any();
    if ctx.registry.remove_leaf_resource(&name).is_none() {
        debug!(cluster = %name, "cluster was not registered");
    }
    Action::await_change()
}

/// Reconcile one `Cluster`
pub async fn reconcile(
    cluster: Arc<Cluster>,
    ctx: Arc<ClusterContext>,
) -> std::result::Result<Action, ClusterError> {
    let start = Instant::now();
    metrics::increment_reconciliations(CONTROLLER_NAME);

    let api: Api<Cluster> = Api::all(ctx.client.clone());
    let shared = ctx.as_ref();
    let result = finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async move {
        match event {
            Finalizer::Apply(cluster) => apply(cluster, shared).await,
            Finalizer::Cleanup(cluster) => Ok(cleanup(&cluster, shared)),
        }
    })
    .await;

    metrics::observe_reconciliation_duration(CONTROLLER_NAME, start.elapsed().as_secs_f64());
    if result.is_err() {
        metrics::increment_reconciliation_errors(CONTROLLER_NAME);
    }
    result
}

/// Retry policy for failed cluster reconciles
pub fn error_policy(cluster: Arc<Cluster>, err: &ClusterError, ctx: Arc<ClusterContext>) -> Action {
    let name = cluster.name_any();
    let transient = match err {
        kube_runtime::finalizer::Error::ApplyFailed(e)
        | kube_runtime::finalizer::Error::CleanupFailed(e) => e.is_transient(),
        _ => true,
    };
    if transient {
        warn!(cluster = %name, error = %err, "cluster reconcile failed, retrying");
        metrics::increment_requeues(CONTROLLER_NAME, "error_backoff");
        Action::requeue(ctx.config.leaf_not_ready_requeue())
    } else {
        error!(cluster = %name, error = %err, "cluster reconcile failed permanently");
        metrics::increment_requeues(CONTROLLER_NAME, "error_fixed");
        Action::requeue(ctx.config.permanent_error_requeue())
    }
}

/// Run the cluster controller until `cancel` fires
pub async fn run(ctx: Arc<ClusterContext>, cancel: CancellationToken) {
    let api: Api<Cluster> = Api::all(ctx.client.clone());
    let workers = u16::try_from(ctx.config.cluster_workers.max(1)).unwrap_or(u16::MAX);
    info!(controller = CONTROLLER_NAME, workers, "starting controller");

    let controller = Controller::new(api, watcher::Config::default().any_semantic())
        .with_config(ControllerRunConfig::default().concurrency(workers))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(cluster = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "cluster controller event"),
            }
        })
        .instrument(tracing::info_span!("controller", name = CONTROLLER_NAME));

    tokio::select! {
        () = cancel.cancelled() => {}
        () = controller => warn!(controller = CONTROLLER_NAME, "controller stream ended"),
    }
    info!(controller = CONTROLLER_NAME, "controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LeafModel, NodeSelector};
    use crate::leaf::LeafMode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn gpu_selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([("gpu".to_string(), "true".to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_models_claims_one_pooled_node() {
        let nodes = cluster_nodes("leafA", &ClusterTreeOptions::default(), "kosmos-");
        assert_eq!(nodes, vec![ClusterNode::party("kosmos-leafA", "leafA", None)]);
    }

    #[test]
    fn test_models_map_to_modes() {
        let options = ClusterTreeOptions {
            enable: true,
            leaf_models: vec![
                LeafModel {
                    leaf_node_name: None,
                    node_selector: NodeSelector {
                        node_name: Some("kosmos-leafA-node1".into()),
                        label_selector: None,
                    },
                },
                LeafModel {
                    leaf_node_name: Some("kosmos-leafA-gpu".into()),
                    node_selector: NodeSelector {
                        node_name: None,
                        label_selector: Some(gpu_selector()),
                    },
                },
            ],
        };
        let nodes = cluster_nodes("leafA", &options, "kosmos-");
        assert_eq!(nodes[0].node_name, "kosmos-leafA-node1");
        assert_eq!(nodes[0].mode, LeafMode::Node);
        assert_eq!(nodes[1].node_name, "kosmos-leafA-gpu");
        assert_eq!(nodes[1].mode, LeafMode::Party);
        assert_eq!(nodes[1].selector, Some(gpu_selector()));
    }

    #[test]
    fn test_fingerprint_tracks_credentials_and_models() {
        let options = ClusterTreeOptions::default();
        let a = fingerprint(b"kubeconfig-a", &options).unwrap();
        assert_eq!(a, fingerprint(b"kubeconfig-a", &options).unwrap());
        assert_ne!(a, fingerprint(b"kubeconfig-b", &options).unwrap());

        let mut with_model = options.clone();
        with_model.leaf_models.push(LeafModel::default());
        assert_ne!(a, fingerprint(b"kubeconfig-a", &with_model).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_serverless_material_includes_token() {
        let with = Credentials::Serverless {
            endpoint: "https://compute.example.com".into(),
            token: Some("t0k3n".into()),
        };
        let without = Credentials::Serverless {
            endpoint: "https://compute.example.com".into(),
            token: None,
        };
        assert_ne!(with.material(), without.material());
    }
}

//! # Initialization
//!
//! Process bootstrap: rustls setup, tracing, metrics, server startup,
//! Kubernetes client, root caches and the leaf registry.

use crate::config::{ControllerConfig, ServerConfig, SharedControllerConfig};
use crate::controller::pod::{PodKey, RootPodEventFilter};
use crate::controller::server::{start_server, ServerState};
use crate::env::{spawn_reflector, ReflectorRootStore};
use crate::leaf::LeafResourceRegistry;
use crate::observability;
use crate::runtime::WatchSource;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::Store;
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Initialization result containing all necessary components for the controllers
pub struct InitializationResult {
    /// Kubernetes client of the root cluster
    pub client: Client,
    pub registry: Arc<LeafResourceRegistry>,
    /// Root cluster cache read by projection
    pub root: Arc<ReflectorRootStore>,
    /// Reader of the root pod cache
    pub pods: Store<Pod>,
    /// Root pod watch, handed to the pod engine
    pub pod_source: WatchSource<Pod, PodKey>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
    /// Cancelled on shutdown
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field(
                "server_ready",
                &self.server_state.is_ready.load(Ordering::Relaxed),
            )
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Install logging; `RUST_LOG` overrides the default filter
pub fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clustertree_controller=info".into()),
        )
        .try_init()
    {
        warn!("tracing subscriber already installed: {e}");
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Root caches for pods, ConfigMaps, Secrets, PVCs and Services
/// - The empty leaf registry
///
/// Tracing must already be installed (see [`init_tracing`]).
pub async fn initialize(
    controller_config: ControllerConfig,
    server_config: &ServerConfig,
) -> Result<InitializationResult> {
    // Must run before any TLS connection is made
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Cluster Tree Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let is_ready = Arc::new(AtomicBool::new(false));
    let server_state = Arc::new(ServerState::new(Arc::clone(&is_ready)));

    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let controller_config: SharedControllerConfig = Arc::new(controller_config);
    let cancel = CancellationToken::new();
    let registry = Arc::new(LeafResourceRegistry::new());

    let watch_namespace = controller_config.watch_namespace.as_deref();
    match watch_namespace {
        Some(ns) => info!(namespace = ns, "watching root pods in one namespace"),
        None => info!("watching root pods in all namespaces"),
    }

    let filter = Arc::new(RootPodEventFilter::new(
        Arc::clone(&registry),
        &controller_config,
    ));
    let (pod_source, pods) = WatchSource::new(
        "root-pods",
        scoped_api::<Pod>(&client, watch_namespace),
        watcher::Config::default(),
        filter,
    );

    let config_maps = spawn_reflector(
        scoped_api::<ConfigMap>(&client, watch_namespace),
        cancel.clone(),
    );
    let secrets = spawn_reflector(
        scoped_api::<Secret>(&client, watch_namespace),
        cancel.clone(),
    );
    let pvcs = spawn_reflector(
        scoped_api::<PersistentVolumeClaim>(&client, watch_namespace),
        cancel.clone(),
    );
    // DNS redirection reads the root DNS service outside the watched namespace
    let services = spawn_reflector(Api::<Service>::all(client.clone()), cancel.clone());

    let root = Arc::new(ReflectorRootStore::new(
        pods.clone(),
        config_maps,
        secrets,
        pvcs,
        services,
    ));

    let root_for_ready = Arc::clone(&root);
    tokio::spawn(async move {
        match root_for_ready.wait_until_ready().await {
            Ok(()) => {
                is_ready.store(true, Ordering::Relaxed);
                info!("root caches synced, controller ready");
            }
            Err(e) => error!(error = %e, "root cache closed before syncing"),
        }
    });

    info!("Controller initialized, starting controllers...");

    Ok(InitializationResult {
        client,
        registry,
        root,
        pods,
        pod_source,
        server_state,
        controller_config,
        cancel,
    })
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Wait for the HTTP server to bind
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(server_config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(server_config.poll_interval_ms);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_listening.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

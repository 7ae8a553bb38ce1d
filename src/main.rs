//! # Cluster Tree Controller
//!
//! Projects pods of a root Kubernetes cluster into leaf clusters.
//!
//! ## Overview
//!
//! Leaves register through `Cluster` resources. Each leaf claims one or more
//! virtual nodes of the root cluster. A root pod bound to such a node is
//! recreated in the leaf, together with the ConfigMaps, Secrets and PVCs it
//! references, and is kept in step with the root until either side goes away.
//!
//! Two controllers run side by side:
//!
//! 1. **Cluster registration** - `Cluster` resources to registry entries
//! 2. **Pod projection** - root pods to leaf pods (or serverless orders)
//!
//! Settings come from environment variables; the flags below override them.

use anyhow::{Context, Result};
use clap::Parser;
use clustertree_controller::config::{parse_label_list, ControllerConfig, ServerConfig};
use clustertree_controller::controller::cluster::{self, ClusterContext};
use clustertree_controller::controller::pod::{
    serverless_instance_lister, KubeRootPodClient, PodKey, RootPodReconciler,
};
use clustertree_controller::runtime::initialization::{init_tracing, initialize};
use clustertree_controller::runtime::{ChannelSource, Engine, EngineConfig, PollingSource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "clustertree-controller")]
#[command(about = "Projects root-cluster pods into leaf clusters", long_about = None)]
struct Args {
    /// Only project pods of this namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Pod reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Convert automounted ServiceAccount tokens into leaf-local projections
    #[arg(long)]
    enable_service_account: Option<bool>,

    /// Comma separated labels stripped from leaf copies
    #[arg(long)]
    ignore_labels: Option<String>,

    /// Point ClusterFirst pods at the root cluster DNS service
    #[arg(long)]
    root_coredns: Option<bool>,

    /// Port for /metrics, /healthz and /readyz
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Args {
    fn apply(self, controller: &mut ControllerConfig, server: &mut ServerConfig) {
        if let Some(namespace) = self.namespace.filter(|ns| !ns.is_empty()) {
            controller.watch_namespace = Some(namespace);
        }
        if let Some(workers) = self.workers {
            controller.pod_workers = workers;
        }
        if let Some(enabled) = self.enable_service_account {
            controller.enable_service_account = enabled;
        }
        if let Some(labels) = self.ignore_labels {
            controller.ignore_labels = parse_label_list(&labels);
        }
        if let Some(enabled) = self.root_coredns {
            controller.root_coredns = enabled;
        }
        if let Some(port) = self.metrics_port {
            server.metrics_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut controller_config = ControllerConfig::from_env();
    let mut server_config = ServerConfig::from_env();
    args.apply(&mut controller_config, &mut server_config);

    let init = initialize(controller_config, &server_config)
        .await
        .context("Failed to initialize controller")?;
    let config = Arc::clone(&init.controller_config);

    let reconciler = Arc::new(RootPodReconciler::new(
        Arc::clone(&init.registry),
        Arc::clone(&init.root) as _,
        Arc::new(KubeRootPodClient::new(init.client.clone())),
        Arc::clone(&config),
    ));

    let (requeues, pod_keys) = ChannelSource::<PodKey>::new();
    let engine_config = EngineConfig {
        workers: config.pod_workers,
        backoff_start: config.backoff_start_duration(),
        backoff_max: config.backoff_max_duration(),
    };
    let engine = Engine::new("pod", reconciler, &engine_config)
        .with_source(Box::new(init.pod_source))
        .with_source(Box::new(requeues))
        .with_source(Box::new(PollingSource::new(
            "serverless-instances",
            config.serverless_poll_interval(),
            serverless_instance_lister(Arc::clone(&init.registry)),
        )));

    let cluster_ctx = Arc::new(ClusterContext::new(
        init.client.clone(),
        Arc::clone(&init.registry),
        Arc::clone(&config),
        init.pods.clone(),
        pod_keys,
    ));

    let cancel = init.cancel.clone();
    let pods = tokio::spawn(engine.run(cancel.clone()));
    let clusters = tokio::spawn(cluster::run(cluster_ctx, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping controllers");
    init.server_state.is_ready.store(false, Ordering::Relaxed);
    cancel.cancel();

    for (name, handle) in [("pod", pods), ("cluster", clusters)] {
        if let Err(e) = handle.await {
            error!(controller = name, error = %e, "controller task failed");
        }
    }

    info!("Controller stopped");
    Ok(())
}

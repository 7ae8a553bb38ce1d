//! # Root Object Cache
//!
//! Read-only accessors over the root cluster's cached objects.
//!
//! Projection never reads the root API server directly. Everything it needs
//! (the pod itself, the ConfigMaps/Secrets/PVCs it depends on, Services for
//! environment variables and DNS) comes from reflector stores kept current
//! by watches started at bootstrap.
//!
//! - `resolver`: turns `envFrom`/`valueFrom` references into literal values

pub mod resolver;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::Api;
use kube::Resource;
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lookups needed to materialise a container's environment
pub trait EnvResourceGetter: Send + Sync {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>>;
    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;
    /// Every cached Service, across namespaces
    fn list_services(&self) -> Vec<Arc<Service>>;
}

/// Everything projection reads from the root cluster
pub trait RootStore: EnvResourceGetter {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
    fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>>;

    fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.list_services().into_iter().find(|svc| {
            svc.metadata.namespace.as_deref() == Some(namespace)
                && svc.metadata.name.as_deref() == Some(name)
        })
    }
}

/// [`RootStore`] over kube reflector stores
#[derive(Clone)]
pub struct ReflectorRootStore {
    pods: Store<Pod>,
    config_maps: Store<ConfigMap>,
    secrets: Store<Secret>,
    pvcs: Store<PersistentVolumeClaim>,
    services: Store<Service>,
}

impl Debug for ReflectorRootStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectorRootStore")
            .field("pods", &self.pods.len())
            .field("config_maps", &self.config_maps.len())
            .field("secrets", &self.secrets.len())
            .field("pvcs", &self.pvcs.len())
            .field("services", &self.services.len())
            .finish()
    }
}

impl ReflectorRootStore {
    pub fn new(
        pods: Store<Pod>,
        config_maps: Store<ConfigMap>,
        secrets: Store<Secret>,
        pvcs: Store<PersistentVolumeClaim>,
        services: Store<Service>,
    ) -> Self {
        Self {
            pods,
            config_maps,
            secrets,
            pvcs,
            services,
        }
    }

    /// Wait until every store has seen its initial listing
    pub async fn wait_until_ready(&self) -> Result<(), reflector::store::WriterDropped> {
        self.pods.wait_until_ready().await?;
        self.config_maps.wait_until_ready().await?;
        self.secrets.wait_until_ready().await?;
        self.pvcs.wait_until_ready().await?;
        self.services.wait_until_ready().await
    }
}

impl EnvResourceGetter for ReflectorRootStore {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.get(&ObjectRef::new(name).within(namespace))
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.get(&ObjectRef::new(name).within(namespace))
    }

    fn list_services(&self) -> Vec<Arc<Service>> {
        self.services.state()
    }
}

impl RootStore for ReflectorRootStore {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.get(&ObjectRef::new(name).within(namespace))
    }

    fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }
}

/// Keep a store of `api`'s objects current until `cancel` fires
pub fn spawn_reflector<K>(api: Api<K>, cancel: CancellationToken) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&()).to_string();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects();

    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "root cache watch error"),
                    None => break,
                },
            }
        }
        debug!(kind = %kind, "root cache reflector stopped");
    });

    reader
}

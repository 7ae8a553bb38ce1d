//! # Leaf Client
//!
//! Object verbs a native leaf backend must support.
//!
//! `get_*` maps a 404 to `None`, `delete_pod` maps a 404 to success, and
//! `create_*` maps a 409 to [`Error::AlreadyExists`] so callers can verify
//! ownership of the existing object before treating the create as done.

use crate::constants::FIELD_MANAGER;
use crate::observability::metrics;
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, ServiceAccount,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// Object verbs against one leaf cluster
#[async_trait]
pub trait LeafClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    async fn update_pod(&self, pod: &Pod) -> Result<Pod>;
    /// Delete a pod; a missing pod is not an error
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn get_pvc(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;
    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount>;
}

/// [`LeafClient`] backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeLeafClient {
    cluster_name: String,
    client: Client,
    config: Config,
}

impl Debug for KubeLeafClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeafClient")
            .field("cluster_name", &self.cluster_name)
            .field("cluster_url", &self.config.cluster_url)
            .finish_non_exhaustive()
    }
}

impl KubeLeafClient {
    /// Build a client from an already resolved [`Config`]
    pub fn new(cluster_name: impl Into<String>, config: Config) -> Result<Self> {
        let cluster_name = cluster_name.into();
        let client = Client::try_from(config.clone()).map_err(|e| Error::InvalidKubeconfig {
            cluster: cluster_name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            cluster_name,
            client,
            config,
        })
    }

    /// Build a client from raw kubeconfig bytes, as stored on a `Cluster`
    pub async fn from_kubeconfig(cluster_name: &str, kubeconfig: &[u8]) -> Result<Self> {
        let invalid = |message: String| Error::InvalidKubeconfig {
            cluster: cluster_name.to_string(),
            message,
        };
        let raw = std::str::from_utf8(kubeconfig)
            .map_err(|e| invalid(format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig =
            Kubeconfig::from_yaml(raw).map_err(|e| invalid(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| invalid(format!("failed to build config: {e}")))?;
        Self::new(cluster_name, config)
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, api: Api<K>, name: &str) -> Result<Option<K>>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        Ok(api.get_opt(name).await?)
    }

    async fn create<K>(&self, api: Api<K>, kind: &'static str, resource: &str, obj: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.create(&params, obj).await {
            Ok(created) => {
                metrics::record_leaf_operation(&self.cluster_name, "create", resource);
                debug!(
                    cluster = %self.cluster_name,
                    kind,
                    namespace = obj.meta().namespace.as_deref().unwrap_or_default(),
                    name = obj.meta().name.as_deref().unwrap_or_default(),
                    "created object in leaf"
                );
                Ok(created)
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => Err(Error::AlreadyExists {
                kind,
                namespace: obj.meta().namespace.clone().unwrap_or_default(),
                name: obj.meta().name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K>(&self, api: Api<K>, resource: &str, obj: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::invalid_object(format!("{resource} without a name")))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let updated = api.replace(&name, &params, obj).await?;
        metrics::record_leaf_operation(&self.cluster_name, "update", resource);
        Ok(updated)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<&str> {
    obj.meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::invalid_object("namespaced object without a namespace"))
}

#[async_trait]
impl LeafClient for KubeLeafClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        self.create(self.namespaced(namespace_of(pod)?), "Pod", "pods", pod)
            .await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        self.replace(self.namespaced(namespace_of(pod)?), "pods", pod)
            .await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        let api: Api<Pod> = self.namespaced(namespace);
        let params = DeleteParams {
            grace_period_seconds: grace_period_seconds.and_then(|g| u32::try_from(g).ok()),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => {
                metrics::record_leaf_operation(&self.cluster_name, "delete", "pods");
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!(cluster = %self.cluster_name, namespace, name, "leaf pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.get(Api::all(self.client.clone()), name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.create(
            Api::all(self.client.clone()),
            "Namespace",
            "namespaces",
            namespace,
        )
        .await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.create(
            self.namespaced(namespace_of(config_map)?),
            "ConfigMap",
            "configmaps",
            config_map,
        )
        .await
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.replace(
            self.namespaced(namespace_of(config_map)?),
            "configmaps",
            config_map,
        )
        .await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(
            self.namespaced(namespace_of(secret)?),
            "Secret",
            "secrets",
            secret,
        )
        .await
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        self.replace(self.namespaced(namespace_of(secret)?), "secrets", secret)
            .await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.create(
            self.namespaced(namespace_of(pvc)?),
            "PersistentVolumeClaim",
            "persistentvolumeclaims",
            pvc,
        )
        .await
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.replace(
            self.namespaced(namespace_of(pvc)?),
            "persistentvolumeclaims",
            pvc,
        )
        .await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        self.create(
            self.namespaced(namespace_of(service_account)?),
            "ServiceAccount",
            "serviceaccounts",
            service_account,
        )
        .await
    }
}

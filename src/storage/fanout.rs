//! Concurrent materialisation of a pod's dependents in a leaf.
//!
//! ConfigMaps, Secrets and PVCs are handled by three concurrent tasks. Each
//! task waits for its objects to appear in the root cache (fixed poll
//! interval, per-class ceiling), then creates them in the leaf with a
//! get-before-create check. The call returns only after all three classes
//! are done; failures of every class are reported together.

use crate::config::ControllerConfig;
use crate::env::RootStore;
use crate::leaf::{ClusterNode, LeafClient};
use crate::storage::handlers::leaf_name;
use crate::storage::{is_managed, DependentSet, ProjectedObject, ResourceClass};
use crate::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling bounds for dependency materialisation
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub poll_interval: Duration,
    pub config_map_timeout: Duration,
    pub secret_timeout: Duration,
    pub pvc_timeout: Duration,
}

impl FanoutSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.dependency_poll_interval_ms),
            config_map_timeout: Duration::from_secs(config.configmap_timeout_secs),
            secret_timeout: Duration::from_secs(config.secret_timeout_secs),
            pvc_timeout: Duration::from_secs(config.pvc_timeout_secs),
        }
    }

    fn timeout(&self, class: ResourceClass) -> Duration {
        match class {
            ResourceClass::ConfigMap => self.config_map_timeout,
            ResourceClass::Secret => self.secret_timeout,
            ResourceClass::PersistentVolumeClaim => self.pvc_timeout,
        }
    }
}

/// Shared inputs of the three class tasks
struct Fanout<'a> {
    client: &'a dyn LeafClient,
    cluster: &'a str,
    root: &'a dyn RootStore,
    root_pod: &'a Pod,
    node: &'a ClusterNode,
    namespace: &'a str,
    settings: &'a FanoutSettings,
    cancel: &'a CancellationToken,
}

/// Create every dependent of `root_pod` in the leaf behind `client`
#[allow(clippy::too_many_arguments, reason = "one borrow per collaborator")]
pub async fn materialize_dependents(
    client: &dyn LeafClient,
    cluster: &str,
    root: &dyn RootStore,
    root_pod: &Pod,
    node: &ClusterNode,
    dependents: &DependentSet,
    settings: &FanoutSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = root_pod
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::invalid_object("pod without a namespace"))?;
    let fanout = Fanout {
        client,
        cluster,
        root,
        root_pod,
        node,
        namespace,
        settings,
        cancel,
    };

    let secrets = dependents.all_secrets();
    let no_optional = BTreeSet::new();
    let (config_maps, secrets, pvcs) = tokio::join!(
        fanout.materialize_class(
            ResourceClass::ConfigMap,
            &dependents.config_maps,
            &dependents.optional_config_maps,
        ),
        fanout.materialize_class(ResourceClass::Secret, &secrets, &dependents.optional_secrets),
        fanout.materialize_class(
            ResourceClass::PersistentVolumeClaim,
            &dependents.pvcs,
            &no_optional,
        ),
    );

    let errors: Vec<Error> = config_maps.into_iter().chain(secrets).chain(pvcs).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Dependencies(errors))
    }
}

impl Fanout<'_> {
    /// Materialise every object of one class; returns the failures
    ///
    /// Optional objects missing from the root are skipped without waiting.
    async fn materialize_class(
        &self,
        class: ResourceClass,
        required: &BTreeSet<String>,
        optional: &BTreeSet<String>,
    ) -> Vec<Error> {
        let mut errors = Vec::new();
        let names = required
            .iter()
            .map(|name| (name, false))
            .chain(optional.iter().map(|name| (name, true)));
        for (name, optional) in names {
            if let Err(e) = self.materialize_one(class, name, optional).await {
                warn!(
                    cluster = self.cluster,
                    namespace = self.namespace,
                    name = %name,
                    kind = class.kind(),
                    error = %e,
                    "failed to project dependent"
                );
                errors.push(e);
            }
        }
        errors
    }

    async fn materialize_one(&self, class: ResourceClass, root_name: &str, optional: bool) -> Result<()> {
        let target = leaf_name(class, root_name);
        if let Some(existing) = self.get_leaf(class, target).await? {
            return self.verify_managed(class, target, &existing);
        }

        let mut object = if optional {
            let Some(object) = self.lookup_root(class, root_name) else {
                debug!(
                    cluster = self.cluster,
                    namespace = self.namespace,
                    name = root_name,
                    kind = class.kind(),
                    "optional dependent absent in root, skipping"
                );
                return Ok(());
            };
            object
        } else {
            self.wait_for_root(class, root_name).await?
        };
        object.strip_for_leaf();
        object
            .before_create_in_leaf(self.client, self.cluster, self.root_pod, self.node)
            .await?;

        match self.create_leaf(&object).await {
            Ok(()) => {
                info!(
                    cluster = self.cluster,
                    namespace = self.namespace,
                    name = object.name(),
                    kind = class.kind(),
                    "projected dependent into leaf"
                );
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => {
                let existing = self.get_leaf(class, object.name()).await?.ok_or_else(|| {
                    Error::MissingDependency {
                        kind: class.kind(),
                        namespace: self.namespace.to_string(),
                        name: object.name().to_string(),
                    }
                })?;
                self.verify_managed(class, object.name(), &existing)
            }
            Err(e) => Err(e),
        }
    }

    fn verify_managed(&self, class: ResourceClass, name: &str, existing: &ObjectMeta) -> Result<()> {
        if is_managed(existing) {
            debug!(
                cluster = self.cluster,
                namespace = self.namespace,
                name,
                kind = class.kind(),
                "dependent already projected"
            );
            Ok(())
        } else {
            Err(Error::NamingCollision {
                cluster: self.cluster.to_string(),
                kind: class.kind(),
                namespace: self.namespace.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Poll the root cache until the object shows up or the class ceiling passes
    async fn wait_for_root(&self, class: ResourceClass, name: &str) -> Result<ProjectedObject> {
        let deadline = Instant::now() + self.settings.timeout(class);
        loop {
            if let Some(object) = self.lookup_root(class, name) {
                return Ok(object);
            }
            if Instant::now() >= deadline {
                return Err(Error::DependencyTimeout {
                    kind: class.kind(),
                    namespace: self.namespace.to_string(),
                    name: name.to_string(),
                });
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    fn lookup_root(&self, class: ResourceClass, name: &str) -> Option<ProjectedObject> {
        let ns = self.namespace;
        match class {
            ResourceClass::ConfigMap => self
                .root
                .get_config_map(ns, name)
                .map(|o| ProjectedObject::ConfigMap((*o).clone())),
            ResourceClass::Secret => self
                .root
                .get_secret(ns, name)
                .map(|o| ProjectedObject::Secret((*o).clone())),
            ResourceClass::PersistentVolumeClaim => self
                .root
                .get_pvc(ns, name)
                .map(|o| ProjectedObject::PersistentVolumeClaim((*o).clone())),
        }
    }

    async fn get_leaf(&self, class: ResourceClass, name: &str) -> Result<Option<ObjectMeta>> {
        let ns = self.namespace;
        Ok(match class {
            ResourceClass::ConfigMap => self.client.get_config_map(ns, name).await?.map(|o| o.metadata),
            ResourceClass::Secret => self.client.get_secret(ns, name).await?.map(|o| o.metadata),
            ResourceClass::PersistentVolumeClaim => {
                self.client.get_pvc(ns, name).await?.map(|o| o.metadata)
            }
        })
    }

    async fn create_leaf(&self, object: &ProjectedObject) -> Result<()> {
        match object {
            ProjectedObject::ConfigMap(cm) => self.client.create_config_map(cm).await.map(drop),
            ProjectedObject::Secret(secret) => self.client.create_secret(secret).await.map(drop),
            ProjectedObject::PersistentVolumeClaim(pvc) => {
                self.client.create_pvc(pvc).await.map(drop)
            }
        }
    }
}

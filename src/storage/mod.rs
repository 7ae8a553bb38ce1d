//! # Storage Projection
//!
//! ConfigMaps, Secrets and PersistentVolumeClaims a pod needs in its leaf.
//!
//! - [`DependentSet`]: the objects a pod references, derived from its spec
//! - [`ProjectedObject`]: a root object on its way into a leaf
//! - `handlers`: per-kind `before_create_in_leaf` strategies
//! - `fanout`: concurrent materialisation of a [`DependentSet`]

mod fanout;
mod handlers;

pub use fanout::{materialize_dependents, FanoutSettings};

use crate::constants::{LEAF_ROOT_CA_CONFIGMAP, MANAGED_LABEL_KEY, ROOT_CA_CONFIGMAP};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;

/// Dependency classes materialised concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
}

impl ResourceClass {
    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }
}

/// Root objects a pod depends on, by root name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependentSet {
    pub config_maps: BTreeSet<String>,
    /// Secrets mounted as volumes or projected
    pub secrets: BTreeSet<String>,
    pub image_pull_secrets: BTreeSet<String>,
    pub pvcs: BTreeSet<String>,
    /// ConfigMaps referenced only with `optional: true`
    pub optional_config_maps: BTreeSet<String>,
    /// Secrets referenced only with `optional: true`
    pub optional_secrets: BTreeSet<String>,
}

impl DependentSet {
    /// Collect the dependents of a leaf-shaped pod
    ///
    /// The leaf's own `kube-root-ca.crt` is never projected; a reference to
    /// the renamed root CA is recorded under its root name.
    pub fn from_pod(pod: &Pod) -> Self {
        let mut set = Self::default();
        let Some(spec) = &pod.spec else {
            return set;
        };

        for volume in spec.volumes.iter().flatten() {
            if let Some(cm) = &volume.config_map {
                set.add_config_map(&cm.name, cm.optional);
            }
            if let Some(secret) = &volume.secret {
                if let Some(name) = &secret.secret_name {
                    set.add_secret(name, secret.optional);
                }
            }
            if let Some(pvc) = &volume.persistent_volume_claim {
                set.pvcs.insert(pvc.claim_name.clone());
            }
            for source in volume
                .projected
                .iter()
                .flat_map(|p| p.sources.iter().flatten())
            {
                if let Some(cm) = &source.config_map {
                    set.add_config_map(&cm.name, cm.optional);
                }
                if let Some(secret) = &source.secret {
                    set.add_secret(&secret.name, secret.optional);
                }
            }
        }

        for reference in spec.image_pull_secrets.iter().flatten() {
            set.image_pull_secrets.insert(reference.name.clone());
        }

        // a mandatory reference anywhere makes the object mandatory
        set.optional_config_maps
            .retain(|name| !set.config_maps.contains(name));
        let mandatory_secrets = set.all_secrets();
        set.optional_secrets
            .retain(|name| !mandatory_secrets.contains(name));
        set
    }

    fn add_config_map(&mut self, name: &str, optional: Option<bool>) {
        let root_name = match name {
            ROOT_CA_CONFIGMAP => return,
            LEAF_ROOT_CA_CONFIGMAP => ROOT_CA_CONFIGMAP,
            _ => name,
        };
        if optional == Some(true) {
            self.optional_config_maps.insert(root_name.to_string());
        } else {
            self.config_maps.insert(root_name.to_string());
        }
    }

    fn add_secret(&mut self, name: &str, optional: Option<bool>) {
        if optional == Some(true) {
            self.optional_secrets.insert(name.to_string());
        } else {
            self.secrets.insert(name.to_string());
        }
    }

    /// Mount and image-pull secrets together
    pub fn all_secrets(&self) -> BTreeSet<String> {
        self.secrets
            .union(&self.image_pull_secrets)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.config_maps.is_empty()
            && self.secrets.is_empty()
            && self.image_pull_secrets.is_empty()
            && self.pvcs.is_empty()
            && self.optional_config_maps.is_empty()
            && self.optional_secrets.is_empty()
    }
}

/// A root object on its way into a leaf
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl ProjectedObject {
    #[must_use]
    pub fn class(&self) -> ResourceClass {
        match self {
            Self::ConfigMap(_) => ResourceClass::ConfigMap,
            Self::Secret(_) => ResourceClass::Secret,
            Self::PersistentVolumeClaim(_) => ResourceClass::PersistentVolumeClaim,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::PersistentVolumeClaim(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::PersistentVolumeClaim(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Drop server-populated state and mark the copy as ours
    pub fn strip_for_leaf(&mut self) {
        let meta = self.metadata_mut();
        meta.uid = None;
        meta.resource_version = None;
        meta.creation_timestamp = None;
        meta.deletion_timestamp = None;
        meta.deletion_grace_period_seconds = None;
        meta.generation = None;
        meta.managed_fields = None;
        meta.owner_references = None;
        meta.finalizers = None;
        meta.self_link = None;
        meta.labels
            .get_or_insert_with(Default::default)
            .insert(MANAGED_LABEL_KEY.to_string(), "true".to_string());

        if let Self::PersistentVolumeClaim(pvc) = self {
            // the bound root volume does not exist in the leaf
            if let Some(spec) = pvc.spec.as_mut() {
                spec.volume_name = None;
            }
            pvc.status = None;
        }
    }
}

/// Whether a leaf object was created by this controller
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_LABEL_KEY))
        .is_some_and(|v| v == "true")
}

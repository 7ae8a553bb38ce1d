//! # Pod Translation
//!
//! Pure functions that turn a root pod into its leaf-side shape and back.
//!
//! Leaf pods keep the root pod's `(namespace, name)`. What changes:
//!
//! - server-populated metadata and status are dropped
//! - the `kosmos-io/pod=true` label marks the copy as ours
//! - ignored labels move into the trip-wire annotation, and come back on read
//! - volumes carrying root credentials are removed
//! - placement follows the leaf mode: `Node` keeps the node name, `Party`
//!   clears it and pins the pod with a required node-affinity term
//! - optionally, automounted root tokens become a leaf-local projection and
//!   `ClusterFirst` DNS points at the root cluster's DNS service

use crate::constants::{
    DEFAULT_TOKEN_VOLUME_PREFIX, IGNORED_LABELS_ANNOTATION, KUBE_API_ACCESS_VOLUME_PREFIX,
    LEAF_ROOT_CA_CONFIGMAP, POD_LABEL_KEY, SERVICE_ACCOUNT_MOUNT_PATH,
    SERVICE_ACCOUNT_TOKEN_EXPIRATION_SECS,
};
use crate::leaf::{ClusterNode, LeafMode};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapProjection, Container, DownwardAPIProjection, DownwardAPIVolumeFile,
    KeyToPath, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    ObjectFieldSelector, Pod, PodDNSConfig, PodDNSConfigOption, ProjectedVolumeSource,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use tracing::warn;

/// Name of the volume that replaces automounted root tokens
pub const LEAF_TOKEN_VOLUME: &str = "kosmos-kube-api-access";

/// Whether `pod` was created by this controller
pub fn is_kosmos_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(POD_LABEL_KEY))
        .is_some_and(|v| v == "true")
}

/// Leaf-side copy of `root` placed on `node`, before env resolution and
/// the optional auth/DNS rewrites
pub fn build_leaf_pod(root: &Pod, node: &ClusterNode, ignore_labels: &[String]) -> Pod {
    let mut pod = Pod {
        metadata: leaf_metadata(&root.metadata, ignore_labels),
        spec: root.spec.clone(),
        status: None,
    };
    strip_root_credentials(&mut pod, false);
    apply_placement(&mut pod, node);
    pod
}

fn leaf_metadata(root: &ObjectMeta, ignore_labels: &[String]) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: root.name.clone(),
        namespace: root.namespace.clone(),
        labels: root.labels.clone(),
        annotations: root.annotations.clone(),
        ..Default::default()
    };
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(POD_LABEL_KEY.to_string(), "true".to_string());
    hide_ignored_labels(&mut meta, ignore_labels);
    meta
}

/// Move ignored labels into the trip-wire annotation
pub fn hide_ignored_labels(meta: &mut ObjectMeta, ignore_labels: &[String]) {
    let Some(labels) = meta.labels.as_mut() else {
        return;
    };
    let hidden: BTreeMap<String, String> = ignore_labels
        .iter()
        .filter_map(|key| labels.remove_entry(key))
        .collect();
    if hidden.is_empty() {
        return;
    }
    match serde_json::to_string(&hidden) {
        Ok(encoded) => {
            meta.annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(IGNORED_LABELS_ANNOTATION.to_string(), encoded);
        }
        // a map of strings always serialises; keep the labels if it ever does not
        Err(e) => {
            warn!(error = %e, "failed to encode ignored labels");
            labels.extend(hidden);
        }
    }
}

/// Put labels hidden by [`hide_ignored_labels`] back and drop the annotation
pub fn restore_ignored_labels(meta: &mut ObjectMeta) {
    let Some(encoded) = meta
        .annotations
        .as_mut()
        .and_then(|a| a.remove(IGNORED_LABELS_ANNOTATION))
    else {
        return;
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&encoded) {
        Ok(hidden) => meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(hidden),
        Err(e) => warn!(
            name = meta.name.as_deref().unwrap_or_default(),
            error = %e,
            "malformed ignored-labels annotation"
        ),
    }
    if meta.annotations.as_ref().is_some_and(BTreeMap::is_empty) {
        meta.annotations = None;
    }
}

/// Leaf copy as the root would see it: trip-wire undone
pub fn restore_leaf_pod(mut pod: Pod) -> Pod {
    restore_ignored_labels(&mut pod.metadata);
    pod
}

fn is_root_credential_volume(name: &str, include_api_access: bool) -> bool {
    name.starts_with(DEFAULT_TOKEN_VOLUME_PREFIX)
        || (include_api_access && name.starts_with(KUBE_API_ACCESS_VOLUME_PREFIX))
}

/// Remove volumes (and their mounts) that carry root cluster credentials
///
/// `default-token-*` volumes are always removed. `kube-api-access-*`
/// volumes are removed too when `include_api_access` is set.
pub fn strip_root_credentials(pod: &mut Pod, include_api_access: bool) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let Some(volumes) = spec.volumes.as_mut() else {
        return;
    };
    let removed: Vec<String> = volumes
        .iter()
        .filter(|v| is_root_credential_volume(&v.name, include_api_access))
        .map(|v| v.name.clone())
        .collect();
    if removed.is_empty() {
        return;
    }
    volumes.retain(|v| !removed.contains(&v.name));
    if volumes.is_empty() {
        spec.volumes = None;
    }

    for container in spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
    {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| !removed.contains(&m.name));
            if mounts.is_empty() {
                container.volume_mounts = None;
            }
        }
    }
}

/// Pin the pod according to the leaf mode of `node`
pub fn apply_placement(pod: &mut Pod, node: &ClusterNode) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    match node.mode {
        LeafMode::Node => {
            spec.node_name = Some(node.node_name.clone());
        }
        LeafMode::Party => {
            spec.node_name = None;
            if let Some(requirements) = node.selector.as_ref().map(selector_requirements) {
                if !requirements.is_empty() {
                    require_node_terms(spec.affinity.get_or_insert_with(Affinity::default), requirements);
                }
            }
        }
    }
}

/// Node-selector requirements equivalent to a label selector
pub fn selector_requirements(selector: &LabelSelector) -> Vec<NodeSelectorRequirement> {
    let from_labels = selector.match_labels.iter().flatten().map(|(k, v)| NodeSelectorRequirement {
        key: k.clone(),
        operator: "In".to_string(),
        values: Some(vec![v.clone()]),
    });
    let from_expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|e| NodeSelectorRequirement {
            key: e.key.clone(),
            operator: e.operator.clone(),
            values: e.values.clone(),
        });
    from_labels.chain(from_expressions).collect()
}

/// AND `requirements` into every required term (terms themselves are ORed)
fn require_node_terms(affinity: &mut Affinity, requirements: Vec<NodeSelectorRequirement>) {
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
    let required = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if required.node_selector_terms.is_empty() {
        required.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: Some(requirements),
            match_fields: None,
        });
        return;
    }
    for term in &mut required.node_selector_terms {
        let expressions = term.match_expressions.get_or_insert_with(Vec::new);
        for requirement in &requirements {
            if !expressions.contains(requirement) {
                expressions.push(requirement.clone());
            }
        }
    }
}

/// Replace automounted root tokens with a leaf-local token projection
///
/// Returns `false` when the pod opted out of automounting.
pub fn convert_service_account_auth(pod: &mut Pod) -> bool {
    strip_root_credentials(pod, true);
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };
    if spec.automount_service_account_token == Some(false) {
        return false;
    }
    spec.automount_service_account_token = Some(false);

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == LEAF_TOKEN_VOLUME) {
        volumes.push(leaf_token_volume());
    }
    for container in spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
    {
        mount_leaf_token(container);
    }
    true
}

fn leaf_token_volume() -> Volume {
    Volume {
        name: LEAF_TOKEN_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o644),
            sources: Some(vec![
                VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: None,
                        expiration_seconds: Some(SERVICE_ACCOUNT_TOKEN_EXPIRATION_SECS),
                        path: "token".to_string(),
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: LEAF_ROOT_CA_CONFIGMAP.to_string(),
                        items: Some(vec![KeyToPath {
                            key: "ca.crt".to_string(),
                            path: "ca.crt".to_string(),
                            mode: None,
                        }]),
                        optional: None,
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    downward_api: Some(DownwardAPIProjection {
                        items: Some(vec![DownwardAPIVolumeFile {
                            path: "namespace".to_string(),
                            field_ref: Some(ObjectFieldSelector {
                                api_version: Some("v1".to_string()),
                                field_path: "metadata.namespace".to_string(),
                            }),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    }
}

fn mount_leaf_token(container: &mut Container) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if mounts.iter().any(|m| m.mount_path == SERVICE_ACCOUNT_MOUNT_PATH) {
        return;
    }
    mounts.push(VolumeMount {
        name: LEAF_TOKEN_VOLUME.to_string(),
        mount_path: SERVICE_ACCOUNT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
}

/// Point a `ClusterFirst` pod at the root DNS service at `dns_ip`
///
/// Returns `false` when the pod uses another DNS policy.
pub fn redirect_dns(pod: &mut Pod, dns_ip: &str) -> bool {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };
    if spec.host_network == Some(true) {
        return false;
    }
    match spec.dns_policy.as_deref() {
        None | Some("ClusterFirst") => {}
        Some(_) => return false,
    }

    spec.dns_policy = Some("None".to_string());
    let dns = spec.dns_config.get_or_insert_with(PodDNSConfig::default);
    let nameservers = dns.nameservers.get_or_insert_with(Vec::new);
    nameservers.retain(|ns| ns != dns_ip);
    nameservers.insert(0, dns_ip.to_string());
    if dns.searches.is_none() {
        dns.searches = Some(vec![
            format!("{namespace}.svc.cluster.local"),
            "svc.cluster.local".to_string(),
            "cluster.local".to_string(),
        ]);
    }
    if dns.options.is_none() {
        dns.options = Some(vec![PodDNSConfigOption {
            name: Some("ndots".to_string()),
            value: Some("5".to_string()),
        }]);
    }
    true
}

/// Leaf pod `leaf` with the mutable fields taken from `root`
pub fn apply_root_changes(leaf: &Pod, root: &Pod, ignore_labels: &[String]) -> Pod {
    let mut updated = leaf.clone();
    let fresh = leaf_metadata(&root.metadata, ignore_labels);
    updated.metadata.labels = fresh.labels;
    updated.metadata.annotations = fresh.annotations;

    let (Some(spec), Some(root_spec)) = (updated.spec.as_mut(), root.spec.as_ref()) else {
        return updated;
    };
    copy_images(&mut spec.containers, &root_spec.containers);
    if let (Some(init), Some(root_init)) = (
        spec.init_containers.as_mut(),
        root_spec.init_containers.as_ref(),
    ) {
        copy_images(init, root_init);
    }
    spec.active_deadline_seconds = root_spec.active_deadline_seconds;
    spec.tolerations.clone_from(&root_spec.tolerations);
    updated
}

fn copy_images(containers: &mut [Container], root: &[Container]) {
    for container in containers {
        if let Some(source) = root.iter().find(|c| c.name == container.name) {
            container.image.clone_from(&source.image);
        }
    }
}

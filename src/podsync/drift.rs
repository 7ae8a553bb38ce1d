//! Semantic comparison between a root pod and its leaf copy.
//!
//! Only fields the projection keeps in sync count: container images,
//! `activeDeadlineSeconds`, tolerations, labels, annotations, and the
//! deletion grace period and timestamp. Markers this controller adds to the
//! leaf copy are ignored.

use crate::constants::{IGNORED_LABELS_ANNOTATION, POD_LABEL_KEY};
use k8s_openapi::api::core::v1::{Container, Pod};
use std::collections::BTreeMap;

fn images(containers: Option<&Vec<Container>>) -> Vec<(&str, Option<&str>)> {
    containers
        .into_iter()
        .flatten()
        .map(|c| (c.name.as_str(), c.image.as_deref()))
        .collect()
}

fn without<'a>(
    map: Option<&'a BTreeMap<String, String>>,
    key: &str,
) -> BTreeMap<&'a str, &'a str> {
    map.into_iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Whether the synced fields of `a` and `b` differ
pub fn pods_differ(a: &Pod, b: &Pod) -> bool {
    let (a_spec, b_spec) = (a.spec.as_ref(), b.spec.as_ref());

    images(a_spec.map(|s| &s.containers)) != images(b_spec.map(|s| &s.containers))
        || images(a_spec.and_then(|s| s.init_containers.as_ref()))
            != images(b_spec.and_then(|s| s.init_containers.as_ref()))
        || a_spec.and_then(|s| s.active_deadline_seconds)
            != b_spec.and_then(|s| s.active_deadline_seconds)
        || a_spec.and_then(|s| s.tolerations.as_ref())
            != b_spec.and_then(|s| s.tolerations.as_ref())
        || without(a.metadata.labels.as_ref(), POD_LABEL_KEY)
            != without(b.metadata.labels.as_ref(), POD_LABEL_KEY)
        || without(a.metadata.annotations.as_ref(), IGNORED_LABELS_ANNOTATION)
            != without(b.metadata.annotations.as_ref(), IGNORED_LABELS_ANNOTATION)
        || a.metadata.deletion_grace_period_seconds != b.metadata.deletion_grace_period_seconds
        || a.metadata.deletion_timestamp != b.metadata.deletion_timestamp
}

/// Whether the leaf copy needs an update to match `root`
pub fn needs_update(root: &Pod, leaf: &Pod) -> bool {
    pods_differ(root, leaf)
}

/// Whether a root pod update from `old` to `new` needs a reconcile
///
/// A change of node assignment always counts, since that is what moves a
/// pod from "waiting for scheduling" to "create in leaf".
pub fn should_enqueue(old: &Pod, new: &Pod) -> bool {
    let node = |p: &Pod| p.spec.as_ref().and_then(|s| s.node_name.clone());
    node(old) != node(new) || pods_differ(old, new)
}

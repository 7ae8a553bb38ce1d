//! Native pod projection against an in-memory leaf.

mod common;

use clustertree_controller::constants::{
    LEAF_ROOT_CA_CONFIGMAP, MANAGED_LABEL_KEY, POD_LABEL_KEY, ROOT_CA_CONFIGMAP,
    SELECTED_NODE_ANNOTATION, SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_TYPE,
    SERVICE_ACCOUNT_UID_ANNOTATION,
};
use clustertree_controller::leaf::{ClusterNode, LeafOptions};
use clustertree_controller::podsync::native::NativePodSyncer;
use clustertree_controller::podsync::translate::LEAF_TOKEN_VOLUME;
use clustertree_controller::podsync::PodSyncer;
use clustertree_controller::Error;
use common::{config_map, context, meta, root_pod, test_config, FakeLeafClient, FakeRootStore};
use k8s_openapi::api::core::v1::{
    ConfigMapProjection, ConfigMapVolumeSource, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, ProjectedVolumeSource, Secret, SecretVolumeSource,
    Volume, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use std::sync::Arc;

const NODE: &str = "kosmos-leafA-node1";

fn syncer(client: &Arc<FakeLeafClient>, options: LeafOptions) -> NativePodSyncer {
    NativePodSyncer::new("leafA".to_string(), Arc::clone(client) as _, options)
}

fn node() -> ClusterNode {
    ClusterNode::node(NODE, "leafA")
}

fn config_map_volume(name: &str) -> Volume {
    Volume {
        name: format!("{name}-vol"),
        config_map: Some(ConfigMapVolumeSource {
            name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str) -> Volume {
    Volume {
        name: format!("{name}-vol"),
        secret: Some(SecretVolumeSource {
            secret_name: Some(name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pvc_volume(name: &str) -> Volume {
    Volume {
        name: format!("{name}-vol"),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

fn with_volumes(mut pod: Pod, volumes: Vec<Volume>) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.volumes = Some(volumes);
    }
    pod
}

fn secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

fn pvc(namespace: &str, name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            uid: Some("root-pvc-uid".to_string()),
            ..meta(namespace, name)
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some("pv-root-1".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Root store holding 2 ConfigMaps, 1 Secret and 1 PVC, and a pod using all of them
fn fanout_fixture() -> (Arc<FakeRootStore>, Pod) {
    let root = FakeRootStore::new();
    root.put_config_map(config_map("default", "app-config", &[("mode", "prod")]));
    root.put_config_map(config_map("default", "feature-flags", &[("beta", "on")]));
    root.put_secret(secret("default", "db-credentials"));
    root.put_pvc(pvc("default", "data"));
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![
            config_map_volume("app-config"),
            config_map_volume("feature-flags"),
            secret_volume("db-credentials"),
            pvc_volume("data"),
        ],
    );
    (root, pod)
}

#[tokio::test]
async fn test_fanout_creates_exactly_the_dependents() {
    let (root, pod) = fanout_fixture();
    let leaf = FakeLeafClient::new();

    syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap();

    assert!(leaf.config_map("default", "app-config").is_some());
    assert!(leaf.config_map("default", "feature-flags").is_some());
    assert!(leaf.secret("default", "db-credentials").is_some());
    assert!(leaf.pvc("default", "data").is_some());
    // namespace + 4 dependents + pod
    assert_eq!(leaf.writes(), 6);

    let projected = leaf.pvc("default", "data").unwrap();
    assert_eq!(
        projected.metadata.labels.unwrap().get(MANAGED_LABEL_KEY).map(String::as_str),
        Some("true")
    );
    assert_ne!(projected.metadata.uid.as_deref(), Some("root-pvc-uid"));
    assert!(projected.spec.unwrap().volume_name.is_none());
    assert_eq!(
        projected
            .metadata
            .annotations
            .unwrap()
            .get(SELECTED_NODE_ANNOTATION)
            .map(String::as_str),
        Some(NODE)
    );
}

#[tokio::test]
async fn test_failed_class_blocks_pod_but_not_other_classes() {
    let (root, pod) = fanout_fixture();
    let leaf = FakeLeafClient::new();
    leaf.fail_creates_of("PersistentVolumeClaim");

    let err = syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap_err();

    let Error::Dependencies(errors) = &err else {
        panic!("expected aggregated dependency error, got {err}");
    };
    assert_eq!(errors.len(), 1);
    assert!(err.is_transient());

    assert!(leaf.config_map("default", "app-config").is_some());
    assert!(leaf.config_map("default", "feature-flags").is_some());
    assert!(leaf.secret("default", "db-credentials").is_some());
    assert!(leaf.pvc("default", "data").is_none());
    assert!(leaf.pod("default", "web-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_dependency_times_out() {
    let root = FakeRootStore::new();
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![config_map_volume("never-created")],
    );
    let leaf = FakeLeafClient::new();

    let err = syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap_err();

    let Error::Dependencies(errors) = err else {
        panic!("expected aggregated dependency error");
    };
    assert!(matches!(
        errors.as_slice(),
        [Error::DependencyTimeout { kind: "ConfigMap", .. }]
    ));
    assert_eq!(leaf.pod_count(), 0);
}

#[tokio::test]
async fn test_create_twice_yields_one_pod() {
    let (root, pod) = fanout_fixture();
    let leaf = FakeLeafClient::new();
    let syncer = syncer(&leaf, LeafOptions::default());
    let ctx = context(root, test_config());

    syncer.create(&ctx, &pod, &node()).await.unwrap();
    let writes = leaf.writes();
    // a duplicate enqueue that raced past the leaf pod lookup
    syncer.create(&ctx, &pod, &node()).await.unwrap();

    assert_eq!(leaf.pod_count(), 1);
    assert_eq!(leaf.writes(), writes);
}

#[tokio::test]
async fn test_unmanaged_pod_is_a_naming_collision() {
    let root = FakeRootStore::new();
    root.put_config_map(config_map("default", "app-config", &[]));
    let leaf = FakeLeafClient::new();
    leaf.seed_pod(Pod {
        metadata: meta("default", "web-1"),
        ..Default::default()
    });
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![config_map_volume("app-config")],
    );

    let err = syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NamingCollision { kind: "Pod", .. }));
    assert!(!err.is_transient());
    // the blocked create leaves the leaf untouched
    assert_eq!(leaf.writes(), 0);
    assert!(!leaf.has_namespace("default"));
    assert!(leaf.config_map("default", "app-config").is_none());
}

#[tokio::test]
async fn test_missing_optional_config_map_does_not_block_the_pod() {
    let root = FakeRootStore::new();
    root.put_config_map(config_map("default", "app-config", &[("mode", "prod")]));
    root.put_config_map(config_map("default", "tuning", &[("gc", "low")]));
    let optional = |name: &str| Volume {
        name: format!("{name}-vol"),
        config_map: Some(ConfigMapVolumeSource {
            name: name.to_string(),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![
            config_map_volume("app-config"),
            optional("tuning"),
            optional("never-created"),
        ],
    );
    let leaf = FakeLeafClient::new();

    syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap();

    assert!(leaf.pod("default", "web-1").is_some());
    assert!(leaf.config_map("default", "app-config").is_some());
    assert!(leaf.config_map("default", "tuning").is_some());
    assert!(leaf.config_map("default", "never-created").is_none());
}

#[tokio::test]
async fn test_unmanaged_dependent_is_a_naming_collision() {
    let root = FakeRootStore::new();
    root.put_config_map(config_map("default", "app-config", &[]));
    let leaf = FakeLeafClient::new();
    leaf.seed_config_map(config_map("default", "app-config", &[("owner", "someone-else")]));
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![config_map_volume("app-config")],
    );

    let err = syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    assert!(leaf.pod("default", "web-1").is_none());
    assert_eq!(
        leaf.config_map("default", "app-config").unwrap().data.unwrap()["owner"],
        "someone-else"
    );
}

#[tokio::test]
async fn test_party_mode_injects_required_affinity() {
    let leaf = FakeLeafClient::new();
    let node = ClusterNode::party(
        "kosmos-leafA",
        "leafA",
        Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("gpu".to_string(), "true".to_string())])),
            ..Default::default()
        }),
    );

    syncer(&leaf, LeafOptions::default())
        .create(
            &context(FakeRootStore::new(), test_config()),
            &root_pod("default", "train-1", "kosmos-leafA"),
            &node,
        )
        .await
        .unwrap();

    let spec = leaf.pod("default", "train-1").unwrap().spec.unwrap();
    assert!(spec.node_name.is_none());
    let terms = spec
        .affinity
        .unwrap()
        .node_affinity
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .unwrap()
        .node_selector_terms;
    assert_eq!(terms.len(), 1);
    let requirement = &terms[0].match_expressions.as_ref().unwrap()[0];
    assert_eq!(requirement.key, "gpu");
    assert_eq!(requirement.operator, "In");
    assert_eq!(requirement.values, Some(vec!["true".to_string()]));
}

#[tokio::test]
async fn test_node_mode_keeps_node_name_without_affinity() {
    let leaf = FakeLeafClient::new();

    syncer(&leaf, LeafOptions::default())
        .create(
            &context(FakeRootStore::new(), test_config()),
            &root_pod("default", "web-1", NODE),
            &node(),
        )
        .await
        .unwrap();

    let spec = leaf.pod("default", "web-1").unwrap().spec.unwrap();
    assert_eq!(spec.node_name.as_deref(), Some(NODE));
    assert!(spec.affinity.is_none());
}

#[tokio::test]
async fn test_service_account_token_secret_points_at_leaf_account() {
    let root = FakeRootStore::new();
    root.put_secret(Secret {
        metadata: ObjectMeta {
            annotations: Some(BTreeMap::from([
                (SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(), "builder".to_string()),
                (SERVICE_ACCOUNT_UID_ANNOTATION.to_string(), "root-sa-uid".to_string()),
            ])),
            ..meta("ci", "builder-token-x7k2p")
        },
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    });
    let pod = with_volumes(
        root_pod("ci", "build-42", NODE),
        vec![secret_volume("builder-token-x7k2p")],
    );
    let leaf = FakeLeafClient::new();

    syncer(&leaf, LeafOptions::default())
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap();

    let account = leaf.service_account("ci", "builder").unwrap();
    let leaf_uid = account.metadata.uid.unwrap();
    let secret = leaf.secret("ci", "builder-token-x7k2p").unwrap();
    assert_eq!(
        secret.metadata.annotations.unwrap().get(SERVICE_ACCOUNT_UID_ANNOTATION),
        Some(&leaf_uid)
    );
}

#[tokio::test]
async fn test_service_account_projection_uses_renamed_root_ca() {
    let root = FakeRootStore::new();
    root.put_config_map(config_map("default", ROOT_CA_CONFIGMAP, &[("ca.crt", "ROOT CA")]));
    let pod = with_volumes(
        root_pod("default", "web-1", NODE),
        vec![Volume {
            name: "kube-api-access-9xk2q".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: ROOT_CA_CONFIGMAP.to_string(),
                        items: Some(vec![KeyToPath {
                            key: "ca.crt".to_string(),
                            path: "ca.crt".to_string(),
                            mode: None,
                        }]),
                        optional: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }],
    );
    let leaf = FakeLeafClient::new();
    let options = LeafOptions {
        enable_service_account: true,
        ..LeafOptions::default()
    };

    syncer(&leaf, options)
        .create(&context(root, test_config()), &pod, &node())
        .await
        .unwrap();

    assert!(leaf.service_account("default", "default").is_some());
    let ca = leaf.config_map("default", LEAF_ROOT_CA_CONFIGMAP).unwrap();
    assert_eq!(ca.data.unwrap()["ca.crt"], "ROOT CA");
    assert!(leaf.config_map("default", ROOT_CA_CONFIGMAP).is_none());

    let spec = leaf.pod("default", "web-1").unwrap().spec.unwrap();
    let volumes = spec.volumes.unwrap();
    assert!(volumes.iter().any(|v| v.name == LEAF_TOKEN_VOLUME));
    assert!(!volumes.iter().any(|v| v.name.starts_with("kube-api-access-")));
    assert_eq!(spec.automount_service_account_token, Some(false));
}

#[tokio::test]
async fn test_delete_is_idempotent_and_spares_unmanaged_pods() {
    let leaf = FakeLeafClient::new();
    let syncer = syncer(&leaf, LeafOptions::default());
    syncer
        .create(
            &context(FakeRootStore::new(), test_config()),
            &root_pod("default", "web-1", NODE),
            &node(),
        )
        .await
        .unwrap();

    syncer.delete("default", "web-1", Some(30)).await.unwrap();
    assert!(leaf.pod("default", "web-1").is_none());
    let writes = leaf.writes();
    syncer.delete("default", "web-1", Some(30)).await.unwrap();
    assert_eq!(leaf.writes(), writes);

    leaf.seed_pod(Pod {
        metadata: meta("default", "hand-made"),
        ..Default::default()
    });
    syncer.delete("default", "hand-made", None).await.unwrap();
    assert!(leaf.pod("default", "hand-made").is_some());
}

#[tokio::test]
async fn test_ignored_labels_round_trip() {
    let leaf = FakeLeafClient::new();
    let options = LeafOptions {
        ignore_labels: vec!["app".to_string()],
        ..LeafOptions::default()
    };
    let syncer = syncer(&leaf, options);

    syncer
        .create(
            &context(FakeRootStore::new(), test_config()),
            &root_pod("default", "web-1", NODE),
            &node(),
        )
        .await
        .unwrap();

    let stored = leaf.pod("default", "web-1").unwrap();
    let labels = stored.metadata.labels.unwrap();
    assert!(!labels.contains_key("app"));
    assert_eq!(labels.get(POD_LABEL_KEY).map(String::as_str), Some("true"));

    let seen = syncer.get("default", "web-1").await.unwrap().unwrap();
    assert_eq!(
        seen.metadata.labels.unwrap().get("app").map(String::as_str),
        Some("web")
    );
}

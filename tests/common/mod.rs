//! In-memory fakes shared by the integration tests.
//!
//! `FakeLeafClient` behaves like a leaf API server for the verbs projection
//! uses: creates conflict on existing names, assign a uid, and count as a
//! write. `FakeRootStore` stands in for the root reflector caches.

#![allow(dead_code)]

use async_trait::async_trait;
use clustertree_controller::config::ControllerConfig;
use clustertree_controller::controller::pod::RootPodClient;
use clustertree_controller::env::{EnvResourceGetter, RootStore};
use clustertree_controller::leaf::{
    ClusterNode, LeafClient, LeafConnection, LeafOptions, LeafResource, LeafResourceRegistry,
};
use clustertree_controller::podsync::ProjectionContext;
use clustertree_controller::{Error, Result};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Namespace, PersistentVolumeClaim, Pod, PodSpec, Secret, Service,
    ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

fn already_exists(kind: &'static str, meta: &ObjectMeta) -> Error {
    Error::AlreadyExists {
        kind,
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
    }
}

fn injected(kind: &str) -> Error {
    Error::Kube(kube::Error::Service(Box::new(std::io::Error::other(format!(
        "injected {kind} failure"
    )))))
}

#[derive(Default)]
struct LeafObjects {
    pods: BTreeMap<Key, Pod>,
    namespaces: BTreeMap<String, Namespace>,
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    next_uid: u64,
}

impl LeafObjects {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.next_uid += 1;
        meta.uid = Some(format!("uid-{}", self.next_uid));
        meta.resource_version = Some(self.next_uid.to_string());
    }
}

/// In-memory leaf cluster
#[derive(Default)]
pub struct FakeLeafClient {
    objects: Mutex<LeafObjects>,
    writes: AtomicUsize,
    /// Kinds whose creates fail
    failing: Mutex<BTreeSet<&'static str>>,
}

impl FakeLeafClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of create/update/delete calls that changed state
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every create of `kind` fail with a transient error
    pub fn fail_creates_of(&self, kind: &'static str) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.objects.lock().unwrap().pods.get(&key(namespace, name)).cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.objects
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.objects.lock().unwrap().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.objects.lock().unwrap().pvcs.get(&key(namespace, name)).cloned()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.objects
            .lock()
            .unwrap()
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.objects.lock().unwrap().namespaces.contains_key(name)
    }

    pub fn pod_count(&self) -> usize {
        self.objects.lock().unwrap().pods.len()
    }

    /// Seed an object that was not created through the client
    pub fn seed_pod(&self, pod: Pod) {
        let mut objects = self.objects.lock().unwrap();
        objects.pods.insert(meta_key(&pod.metadata), pod);
    }

    pub fn seed_config_map(&self, config_map: ConfigMap) {
        let mut objects = self.objects.lock().unwrap();
        objects
            .config_maps
            .insert(meta_key(&config_map.metadata), config_map);
    }

    fn check_failure(&self, kind: &'static str) -> Result<()> {
        if self.failing.lock().unwrap().contains(kind) {
            return Err(injected(kind));
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

macro_rules! create_in {
    ($self:ident, $field:ident, $kind:literal, $obj:expr) => {{
        $self.check_failure($kind)?;
        let mut objects = $self.objects.lock().unwrap();
        let k = meta_key(&$obj.metadata);
        if objects.$field.contains_key(&k) {
            return Err(already_exists($kind, &$obj.metadata));
        }
        let mut created = $obj.clone();
        objects.stamp(&mut created.metadata);
        objects.$field.insert(k, created.clone());
        $self.wrote();
        Ok(created)
    }};
}

macro_rules! update_in {
    ($self:ident, $field:ident, $obj:expr) => {{
        let mut objects = $self.objects.lock().unwrap();
        let k = meta_key(&$obj.metadata);
        if !objects.$field.contains_key(&k) {
            return Err(Error::invalid_object(format!("{}/{} not found", k.0, k.1)));
        }
        objects.$field.insert(k, $obj.clone());
        $self.wrote();
        Ok($obj.clone())
    }};
}

#[async_trait]
impl LeafClient for FakeLeafClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        create_in!(self, pods, "Pod", pod)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        update_in!(self, pods, pod)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        if self
            .objects
            .lock()
            .unwrap()
            .pods
            .remove(&key(namespace, name))
            .is_some()
        {
            self.wrote();
        }
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.objects.lock().unwrap().namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let mut objects = self.objects.lock().unwrap();
        let name = namespace.metadata.name.clone().unwrap_or_default();
        if objects.namespaces.contains_key(&name) {
            return Err(already_exists("Namespace", &namespace.metadata));
        }
        objects.namespaces.insert(name, namespace.clone());
        self.wrote();
        Ok(namespace.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        create_in!(self, config_maps, "ConfigMap", config_map)
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        update_in!(self, config_maps, config_map)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        create_in!(self, secrets, "Secret", secret)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        update_in!(self, secrets, secret)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(namespace, name))
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        create_in!(self, pvcs, "PersistentVolumeClaim", pvc)
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        update_in!(self, pvcs, pvc)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self.service_account(namespace, name))
    }

    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        create_in!(self, service_accounts, "ServiceAccount", service_account)
    }
}

/// In-memory root cache
#[derive(Default)]
pub struct FakeRootStore {
    pods: Mutex<BTreeMap<Key, Arc<Pod>>>,
    config_maps: Mutex<BTreeMap<Key, Arc<ConfigMap>>>,
    secrets: Mutex<BTreeMap<Key, Arc<Secret>>>,
    pvcs: Mutex<BTreeMap<Key, Arc<PersistentVolumeClaim>>>,
    services: Mutex<BTreeMap<Key, Arc<Service>>>,
}

impl FakeRootStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_pod(&self, pod: Pod) {
        self.pods
            .lock()
            .unwrap()
            .insert(meta_key(&pod.metadata), Arc::new(pod));
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.lock().unwrap().remove(&key(namespace, name));
    }

    pub fn put_config_map(&self, config_map: ConfigMap) {
        self.config_maps
            .lock()
            .unwrap()
            .insert(meta_key(&config_map.metadata), Arc::new(config_map));
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets
            .lock()
            .unwrap()
            .insert(meta_key(&secret.metadata), Arc::new(secret));
    }

    pub fn put_pvc(&self, pvc: PersistentVolumeClaim) {
        self.pvcs
            .lock()
            .unwrap()
            .insert(meta_key(&pvc.metadata), Arc::new(pvc));
    }

    pub fn put_service(&self, service: Service) {
        self.services
            .lock()
            .unwrap()
            .insert(meta_key(&service.metadata), Arc::new(service));
    }
}

impl EnvResourceGetter for FakeRootStore {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    fn list_services(&self) -> Vec<Arc<Service>> {
        self.services.lock().unwrap().values().cloned().collect()
    }
}

impl RootStore for FakeRootStore {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.lock().unwrap().get(&key(namespace, name)).cloned()
    }
}

/// Records force deletes of root pods
#[derive(Default)]
pub struct FakeRootPods {
    pub released: Mutex<Vec<Key>>,
}

#[async_trait]
impl RootPodClient for FakeRootPods {
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.released.lock().unwrap().push(key(namespace, name));
        Ok(())
    }
}

/// Config with short dependency ceilings so timeouts resolve quickly under paused time
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        dependency_poll_interval_ms: 10,
        configmap_timeout_secs: 1,
        secret_timeout_secs: 1,
        pvc_timeout_secs: 1,
        ..ControllerConfig::default()
    }
}

pub fn context(root: Arc<FakeRootStore>, config: ControllerConfig) -> ProjectionContext {
    ProjectionContext {
        root,
        config: Arc::new(config),
        cancel: CancellationToken::new(),
    }
}

/// Register `client` as leaf `cluster` claiming `nodes`
pub fn register(
    registry: &LeafResourceRegistry,
    cluster: &str,
    client: Arc<FakeLeafClient>,
    nodes: Vec<ClusterNode>,
) -> Arc<LeafResource> {
    let client: Arc<dyn LeafClient> = client;
    let resource = Arc::new(LeafResource::new(
        cluster,
        LeafConnection::Native { client },
        LeafOptions::default(),
    ));
    registry.add_leaf_resource(Arc::clone(&resource), nodes);
    resource
}

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// A bound root pod with one nginx container
pub fn root_pod(namespace: &str, name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            uid: Some(format!("root-{name}")),
            labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..meta(namespace, name)
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "web".to_string(),
                image: Some("nginx:1.25".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: meta(namespace, name),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

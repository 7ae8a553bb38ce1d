//! # Pod Projection
//!
//! Creates, updates, deletes and reads the leaf copy of a root pod.
//!
//! [`PodSyncer`] is implemented once per backend family:
//!
//! - `native`: a Kubernetes leaf, driven through direct object verbs
//! - `serverless`: an external compute API with label-correlated orders
//!   and no update verb
//!
//! The strategy is chosen when a leaf registers (see
//! [`crate::leaf::LeafResource::new`]); callers never branch on the backend.

pub mod drift;
pub mod native;
pub mod serverless;
pub mod translate;

use crate::config::SharedControllerConfig;
use crate::env::RootStore;
use crate::leaf::{BackendKind, ClusterNode};
use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-reconcile collaborators of a projection
#[derive(Clone)]
pub struct ProjectionContext {
    /// Root cluster cache
    pub root: Arc<dyn RootStore>,
    pub config: SharedControllerConfig,
    /// Cancelled on shutdown; long waits observe it
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ProjectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Backend strategy for the leaf copy of a root pod
///
/// The leaf copy always has the root pod's namespace and name.
#[async_trait]
pub trait PodSyncer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Leaf copy of `namespace/name` as the root would see it
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create the leaf copy of `root` (and its dependents) on `node`
    ///
    /// Creating an already projected pod succeeds without side effects.
    async fn create(&self, ctx: &ProjectionContext, root: &Pod, node: &ClusterNode)
        -> Result<()>;

    /// Bring `leaf` in line with `root`
    async fn update(&self, ctx: &ProjectionContext, root: &Pod, leaf: &Pod) -> Result<()>;

    /// Delete the leaf copy; a missing copy is not an error
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()>;
}

//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use clustertree_controller::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Leaf registration
pub use crate::leaf::registry::LeafResourceRegistry;
pub use crate::leaf::{BackendKind, ClusterNode, LeafMode, LeafOptions, LeafResource};

// Projection seams
pub use crate::env::{EnvResourceGetter, RootStore};
pub use crate::leaf::client::LeafClient;
pub use crate::leaf::serverless::ServerlessApi;
pub use crate::podsync::{PodSyncer, ProjectionContext};

// Pod controller
pub use crate::controller::pod::{decide, PodAction, PodKey, RootPodReconciler, RootPodState};

// Config types
pub use crate::config::{ControllerConfig, ServerConfig, SharedControllerConfig};

pub use crate::error::{Error, Result};

//! # Custom Resource Definitions
//!
//! CRD types consumed by the controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `Cluster` resource and its leaf models

mod spec;

pub use spec::{
    Cluster, ClusterSpec, ClusterTreeOptions, LeafModel, NodeSelector, SecretKeyRef,
    ServerlessSpec,
};

//! Cluster Tree Controller Library
//!
//! Projects pods scheduled onto leaf-backed virtual nodes of a root cluster,
//! together with the ConfigMaps, Secrets and PVCs they depend on, into the
//! leaf clusters (or serverless backends) that actually run them.
//!
//! ## Quick Start
//!
//! ```rust
//! use clustertree_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod env;
pub mod error;
pub mod leaf;
pub mod observability;
pub mod podsync;
pub mod prelude;
pub mod runtime;
pub mod storage;

pub use error::{Error, Result};

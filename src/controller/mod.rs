//! # Controller
//!
//! Controllers run by the binary.
//!
//! - `pod`: projects root pods bound to leaf-backed nodes into their leaves
//! - `cluster`: turns `Cluster` resources into leaf registrations
//! - `server`: HTTP server for metrics and health checks

pub mod cluster;
pub mod pod;
pub mod server;

//! Typed HTTP client for the cloud provisioning control plane.
//!
//! The control plane manages two nested resources: clusters (Kubernetes
//! clusters) and installations (hosted chat tenants bound to a cluster via a
//! cluster installation). This crate exposes the wire types and one module of
//! operations per API surface; it knows nothing about test orchestration.

pub mod api;
pub mod client;
pub mod error;
pub mod models;

pub use client::Client;
pub use error::ClientError;

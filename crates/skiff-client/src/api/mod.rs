//! One module of operations per provisioning API surface.

pub mod cluster_installations;
pub mod clusters;
pub mod databases;
pub mod installations;
pub mod subscriptions;
pub mod webhooks;

//! Cluster installation operations, including the in-pod CLI exec surface.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{ClusterInstallation, ExecRequest};

/// List the cluster installations backing one installation. An installation
/// has exactly one under normal affinity, but the API surface is a list.
pub async fn list_cluster_installations(
    client: &Client,
    installation_id: &str,
) -> Result<Vec<ClusterInstallation>, ClientError> {
    client
        .get_json(&format!(
            "/api/cluster_installations?installation={installation_id}"
        ))
        .await
}

/// Fetch a cluster installation by ID. Returns `None` when unknown.
pub async fn get_cluster_installation(
    client: &Client,
    cluster_installation_id: &str,
) -> Result<Option<ClusterInstallation>, ClientError> {
    client
        .get_json_optional(&format!("/api/cluster_installation/{cluster_installation_id}"))
        .await
}

/// Run a CLI command inside the cluster installation's application
/// container and return its raw output.
pub async fn exec_cli(
    client: &Client,
    cluster_installation_id: &str,
    command: &[&str],
) -> Result<Vec<u8>, ClientError> {
    let request = ExecRequest {
        command: command.iter().map(|s| s.to_string()).collect(),
    };
    client
        .post_bytes(
            &format!("/api/cluster_installation/{cluster_installation_id}/exec"),
            &request,
        )
        .await
}

//! Cluster operations.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{Cluster, CreateClusterRequest, PatchClusterRequest, ProvisionClusterRequest};

/// Request creation of a new cluster. The call returns as soon as the
/// control plane has accepted the request; provisioning continues in the
/// background and is observable through events and webhooks.
pub async fn create_cluster(
    client: &Client,
    request: &CreateClusterRequest,
) -> Result<Cluster, ClientError> {
    client.post_json("/api/clusters", request).await
}

/// Fetch a cluster by ID. Returns `None` when the cluster is unknown.
pub async fn get_cluster(client: &Client, cluster_id: &str) -> Result<Option<Cluster>, ClientError> {
    client
        .get_json_optional(&format!("/api/cluster/{cluster_id}"))
        .await
}

pub async fn list_clusters(client: &Client) -> Result<Vec<Cluster>, ClientError> {
    client.get_json("/api/clusters").await
}

/// Request a reprovision of the cluster's utilities.
pub async fn provision_cluster(
    client: &Client,
    cluster_id: &str,
    request: &ProvisionClusterRequest,
) -> Result<(), ClientError> {
    client
        .post_empty(&format!("/api/cluster/{cluster_id}/provision"), Some(request))
        .await
}

/// Patch mutable cluster fields; used to request a node resize.
pub async fn patch_cluster(
    client: &Client,
    cluster_id: &str,
    request: &PatchClusterRequest,
) -> Result<Cluster, ClientError> {
    client
        .patch_json(&format!("/api/cluster/{cluster_id}"), request)
        .await
}

/// Request deletion of the cluster.
pub async fn delete_cluster(client: &Client, cluster_id: &str) -> Result<(), ClientError> {
    client.delete(&format!("/api/cluster/{cluster_id}")).await
}

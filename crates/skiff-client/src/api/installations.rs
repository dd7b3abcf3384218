//! Installation operations.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{
    CreateInstallationRequest, Installation, PatchDeletionPendingExpiryRequest,
};

pub async fn create_installation(
    client: &Client,
    request: &CreateInstallationRequest,
) -> Result<Installation, ClientError> {
    client.post_json("/api/installations", request).await
}

/// Fetch an installation by ID. Returns `None` when the installation is
/// unknown.
pub async fn get_installation(
    client: &Client,
    installation_id: &str,
) -> Result<Option<Installation>, ClientError> {
    client
        .get_json_optional(&format!("/api/installation/{installation_id}"))
        .await
}

pub async fn list_installations(client: &Client) -> Result<Vec<Installation>, ClientError> {
    client.get_json("/api/installations").await
}

/// Request deletion. Depending on the installation's configuration the
/// control plane either deletes outright or parks the installation in
/// `deletion-pending` until its expiry elapses.
pub async fn delete_installation(
    client: &Client,
    installation_id: &str,
) -> Result<(), ClientError> {
    client
        .delete(&format!("/api/installation/{installation_id}"))
        .await
}

pub async fn hibernate_installation(
    client: &Client,
    installation_id: &str,
) -> Result<(), ClientError> {
    client
        .post_empty(
            &format!("/api/installation/{installation_id}/hibernate"),
            None::<&()>,
        )
        .await
}

pub async fn wake_up_installation(
    client: &Client,
    installation_id: &str,
) -> Result<(), ClientError> {
    client
        .post_empty(
            &format!("/api/installation/{installation_id}/wakeup"),
            None::<&()>,
        )
        .await
}

/// Move the deletion-pending expiry of an installation, typically to an
/// imminent timestamp so a parked deletion proceeds promptly.
pub async fn update_deletion_pending_expiry(
    client: &Client,
    installation_id: &str,
    expiry_millis: i64,
) -> Result<Installation, ClientError> {
    client
        .patch_json(
            &format!("/api/installation/{installation_id}/deletion-pending-expiry"),
            &PatchDeletionPendingExpiryRequest {
                deletion_pending_expiry: expiry_millis,
            },
        )
        .await
}

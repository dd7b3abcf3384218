//! Lifecycle webhook registration.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{CreateWebhookRequest, Webhook};

/// List webhooks registered by `owner_id`.
pub async fn list_webhooks(client: &Client, owner_id: &str) -> Result<Vec<Webhook>, ClientError> {
    client.get_json(&format!("/api/webhooks?owner={owner_id}")).await
}

/// Register a webhook: the control plane will POST lifecycle webhooks to
/// `url` until the webhook is deleted.
pub async fn create_webhook(
    client: &Client,
    request: &CreateWebhookRequest,
) -> Result<Webhook, ClientError> {
    client.post_json("/api/webhooks", request).await
}

pub async fn delete_webhook(client: &Client, webhook_id: &str) -> Result<(), ClientError> {
    client.delete(&format!("/api/webhook/{webhook_id}")).await
}

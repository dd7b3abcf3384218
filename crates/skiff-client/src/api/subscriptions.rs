//! Event subscription registration.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{CreateSubscriptionRequest, Subscription};

/// List subscriptions registered by `owner_id`.
pub async fn list_subscriptions(
    client: &Client,
    owner_id: &str,
) -> Result<Vec<Subscription>, ClientError> {
    client
        .get_json(&format!("/api/subscriptions?owner={owner_id}"))
        .await
}

/// Register a subscription: the control plane will POST state-change events
/// to `url` until the subscription is deleted.
pub async fn create_subscription(
    client: &Client,
    request: &CreateSubscriptionRequest,
) -> Result<Subscription, ClientError> {
    client.post_json("/api/subscriptions", request).await
}

pub async fn delete_subscription(
    client: &Client,
    subscription_id: &str,
) -> Result<(), ClientError> {
    client
        .delete(&format!("/api/subscription/{subscription_id}"))
        .await
}

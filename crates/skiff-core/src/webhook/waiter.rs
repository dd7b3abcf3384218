//! Waiter that consumes the webhook channel until a target state appears.

use std::time::Duration;

use thiserror::Error;

use skiff_client::models::ResourceType;

use super::WebhookChannel;

/// One wait for a resource to reach a state.
#[derive(Debug, Clone)]
pub struct StateWaitRequest<'a> {
    pub resource_type: ResourceType,
    pub resource_id: &'a str,
    pub target_state: &'a str,
    /// States that terminate the wait with an error.
    pub failure_states: &'a [&'a str],
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum WebhookWaitError {
    #[error("timed out after {timeout:?} waiting for {resource_type} {resource_id} to reach {target:?}")]
    Timeout {
        resource_type: ResourceType,
        resource_id: String,
        target: String,
        timeout: Duration,
    },

    #[error("{resource_type} {resource_id} entered failure state {state:?}")]
    FailureState {
        resource_type: ResourceType,
        resource_id: String,
        state: String,
    },

    #[error("webhook channel closed while waiting for {resource_type} {resource_id}")]
    ChannelClosed {
        resource_type: ResourceType,
        resource_id: String,
    },
}

/// Consume the channel until a payload for the requested resource reports
/// the target state, a failure state, or the timeout elapses. Payloads for
/// other resources are consumed and ignored.
pub async fn wait_for_state(
    channel: &WebhookChannel,
    request: &StateWaitRequest<'_>,
) -> Result<(), WebhookWaitError> {
    let mut consumer = channel.consume().await;
    tracing::debug!(
        resource_type = %request.resource_type,
        resource_id = %request.resource_id,
        target = %request.target_state,
        "waiting on webhook channel"
    );

    let wait = async {
        loop {
            let Some(payload) = consumer.recv().await else {
                return Err(WebhookWaitError::ChannelClosed {
                    resource_type: request.resource_type,
                    resource_id: request.resource_id.to_string(),
                });
            };

            if payload.resource_type != request.resource_type || payload.id != request.resource_id {
                continue;
            }
            if payload.new_state == request.target_state {
                return Ok(());
            }
            if request.failure_states.contains(&payload.new_state.as_str()) {
                return Err(WebhookWaitError::FailureState {
                    resource_type: request.resource_type,
                    resource_id: request.resource_id.to_string(),
                    state: payload.new_state,
                });
            }
            tracing::debug!(
                resource_id = %payload.id,
                state = %payload.new_state,
                "intermediate state, still waiting"
            );
        }
    };

    match tokio::time::timeout(request.timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(WebhookWaitError::Timeout {
            resource_type: request.resource_type,
            resource_id: request.resource_id.to_string(),
            target: request.target_state.to_string(),
            timeout: request.timeout,
        }),
    }
}

//! Webhook sink delivery, waiter behavior, and registration lifecycle.

use std::time::Duration;

use skiff_client::Client;
use skiff_client::api::webhooks;
use skiff_client::models::{CreateWebhookRequest, ResourceType};
use skiff_core::webhook::WebhookSink;
use skiff_core::webhook::waiter::{StateWaitRequest, WebhookWaitError, wait_for_state};
use skiff_test_utils::MockProvisioner;

const OWNER: &str = "skiff-e2e";

async fn post_webhook(listen_url: &str, resource_type: &str, id: &str, old: &str, new: &str) {
    let response = reqwest::Client::new()
        .post(listen_url)
        .json(&serde_json::json!({
            "type": resource_type,
            "id": id,
            "old_state": old,
            "new_state": new,
            "timestamp": 0,
        }))
        .send()
        .await
        .expect("webhook POST failed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn waiter_skips_unrelated_payloads_until_target() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let listen_url = "http://127.0.0.1:21821";
    let mut sink = WebhookSink::new(listen_url, OWNER);
    sink.start(&client).await.unwrap();
    assert_eq!(mock.webhook_count(), 1);

    let poster = tokio::spawn({
        let listen_url = listen_url.to_string();
        async move {
            post_webhook(&listen_url, "installation", "other", "n/a", "stable").await;
            post_webhook(&listen_url, "cluster", "c1", "n/a", "creation-requested").await;
            post_webhook(&listen_url, "cluster", "c1", "creation-requested", "stable").await;
        }
    });

    let channel = sink.channel();
    wait_for_state(
        &channel,
        &StateWaitRequest {
            resource_type: ResourceType::Cluster,
            resource_id: "c1",
            target_state: "stable",
            failure_states: &["creation-failed"],
            timeout: Duration::from_secs(5),
        },
    )
    .await
    .unwrap();
    poster.await.unwrap();

    sink.shutdown(&client).await;
    assert_eq!(mock.webhook_count(), 0);
    mock.shutdown().await;
}

#[tokio::test]
async fn waiter_surfaces_failure_state() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let listen_url = "http://127.0.0.1:21822";
    let mut sink = WebhookSink::new(listen_url, OWNER);
    sink.start(&client).await.unwrap();

    let poster = tokio::spawn({
        let listen_url = listen_url.to_string();
        async move {
            post_webhook(&listen_url, "cluster", "c1", "n/a", "creation-failed").await;
        }
    });

    let channel = sink.channel();
    let err = wait_for_state(
        &channel,
        &StateWaitRequest {
            resource_type: ResourceType::Cluster,
            resource_id: "c1",
            target_state: "stable",
            failure_states: &["creation-failed"],
            timeout: Duration::from_secs(5),
        },
    )
    .await
    .unwrap_err();
    match err {
        WebhookWaitError::FailureState { state, .. } => assert_eq!(state, "creation-failed"),
        other => panic!("expected failure state, got {other}"),
    }
    poster.await.unwrap();

    sink.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn waiter_times_out_without_target() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let listen_url = "http://127.0.0.1:21823";
    let mut sink = WebhookSink::new(listen_url, OWNER);
    sink.start(&client).await.unwrap();

    let channel = sink.channel();
    let err = wait_for_state(
        &channel,
        &StateWaitRequest {
            resource_type: ResourceType::Cluster,
            resource_id: "c1",
            target_state: "stable",
            failure_states: &[],
            timeout: Duration::from_millis(200),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, WebhookWaitError::Timeout { .. }), "got {err}");

    sink.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn payloads_with_empty_id_are_dropped() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let listen_url = "http://127.0.0.1:21824";
    let mut sink = WebhookSink::new(listen_url, OWNER);
    sink.start(&client).await.unwrap();

    post_webhook(listen_url, "cluster", "", "n/a", "stable").await;

    let channel = sink.channel();
    let err = wait_for_state(
        &channel,
        &StateWaitRequest {
            resource_type: ResourceType::Cluster,
            resource_id: "c1",
            target_state: "stable",
            failure_states: &[],
            timeout: Duration::from_millis(200),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, WebhookWaitError::Timeout { .. }), "got {err}");

    sink.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn reuses_webhook_owned_by_same_owner_and_url() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let listen_url = "http://127.0.0.1:21825";
    webhooks::create_webhook(
        &client,
        &CreateWebhookRequest {
            owner_id: OWNER.to_string(),
            url: listen_url.to_string(),
        },
    )
    .await
    .unwrap();

    let mut sink = WebhookSink::new(listen_url, OWNER);
    sink.start(&client).await.unwrap();
    assert_eq!(mock.webhook_count(), 1, "existing webhook must be reused");

    sink.shutdown(&client).await;
    assert_eq!(mock.webhook_count(), 0);
    mock.shutdown().await;
}

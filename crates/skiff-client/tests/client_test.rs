//! Client behavior against the mock provisioning API.

use skiff_client::api::{clusters, installations, subscriptions};
use skiff_client::models::{
    CreateClusterRequest, CreateInstallationRequest, CreateSubscriptionRequest,
};
use skiff_client::{Client, ClientError};
use skiff_test_utils::MockProvisioner;

fn cluster_request() -> CreateClusterRequest {
    CreateClusterRequest {
        provider: "aws".to_string(),
        provisioner: "kops".to_string(),
        node_instance_type: "m5.large".to_string(),
        allow_installations: true,
        ..Default::default()
    }
}

#[test]
fn rejects_non_http_base_urls() {
    assert!(matches!(
        Client::new("ftp://example.com"),
        Err(ClientError::InvalidBaseUrl(_))
    ));
}

#[tokio::test]
async fn cluster_crud_round_trip() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let created = clusters::create_cluster(&client, &cluster_request()).await.unwrap();
    assert!(!created.id.is_empty());

    let fetched = clusters::get_cluster(&client, &created.id).await.unwrap();
    assert_eq!(fetched.unwrap().id, created.id);

    let missing = clusters::get_cluster(&client, "cluster-nope").await.unwrap();
    assert!(missing.is_none());

    let listed = clusters::list_clusters(&client).await.unwrap();
    assert_eq!(listed.len(), 1);

    mock.shutdown().await;
}

#[tokio::test]
async fn non_2xx_surfaces_status_and_body() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    // Deleting a subscription that does not exist answers 404, which is not
    // special-cased for deletes.
    let err = subscriptions::delete_subscription(&client, "subscription-nope")
        .await
        .unwrap_err();
    match err {
        ClientError::UnexpectedStatus { status, .. } => {
            assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        }
        other => panic!("expected unexpected-status, got {other}"),
    }

    mock.shutdown().await;
}

#[tokio::test]
async fn subscription_round_trip() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let created = subscriptions::create_subscription(
        &client,
        &CreateSubscriptionRequest {
            owner_id: "owner-a".to_string(),
            url: "http://127.0.0.1:1/".to_string(),
        },
    )
    .await
    .unwrap();

    let mine = subscriptions::list_subscriptions(&client, "owner-a").await.unwrap();
    assert_eq!(mine.len(), 1);
    let theirs = subscriptions::list_subscriptions(&client, "owner-b").await.unwrap();
    assert!(theirs.is_empty());

    subscriptions::delete_subscription(&client, &created.id).await.unwrap();
    assert_eq!(mock.subscription_count(), 0);

    mock.shutdown().await;
}

#[tokio::test]
async fn installation_create_assigns_dns_and_database() {
    let mock = MockProvisioner::spawn().await.unwrap();
    let client = Client::new(mock.url()).unwrap();

    let created = installations::create_installation(
        &client,
        &CreateInstallationRequest {
            owner_id: "owner-a".to_string(),
            dns: "e2e-test-abcd.test.cloud.example.com".to_string(),
            database: "aws-multitenant-rds-postgres".to_string(),
            filestore: "aws-multitenant-s3".to_string(),
            size: "100users".to_string(),
            version: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(created.dns, "e2e-test-abcd.test.cloud.example.com");
    assert!(mock.connection_string(&created.id).is_some());

    mock.shutdown().await;
}

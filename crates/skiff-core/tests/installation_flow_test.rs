//! Full installation lifecycle workflow against the mock provisioning API.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use skiff_client::Client;
use skiff_client::models::installation_state;
use skiff_core::events::RecordMask;
use skiff_core::events::recorder::EventRecorder;
use skiff_core::harness::installation_lifecycle_workflow;
use skiff_core::suites::cluster::{ClusterSuite, ClusterSuiteParams};
use skiff_core::suites::installation::{ExportStats, InstallationSuite, InstallationSuiteParams};
use skiff_core::webhook::WebhookSink;
use skiff_test_utils::{FixtureFileCopier, MockOptions, MockProvisioner, SAMPLE_EXPORT, SOURCE_DB_ID};

const OWNER: &str = "skiff-e2e";

fn fast_mock_options() -> MockOptions {
    MockOptions {
        transition_delay: Duration::from_millis(20),
        delivery_timeout: Duration::from_millis(500),
    }
}

fn suites(
    client: &Arc<Client>,
    sink: &WebhookSink,
    mock_url: &str,
) -> (Arc<ClusterSuite>, Arc<InstallationSuite>) {
    let cluster = Arc::new(ClusterSuite::new(
        Arc::clone(client),
        sink.channel(),
        ClusterSuiteParams {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    ));
    let installation = Arc::new(
        InstallationSuite::new(
            Arc::clone(client),
            sink.channel(),
            Arc::new(FixtureFileCopier::new(SAMPLE_EXPORT)),
            InstallationSuiteParams {
                owner_id: OWNER.to_string(),
                poll_interval: Duration::from_millis(20),
                // Health pings go to the mock instead of the (nonexistent)
                // installation DNS.
                ping_base_url: Some(mock_url.to_string()),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    (cluster, installation)
}

#[tokio::test]
async fn installation_lifecycle_runs_and_verifies_events() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mock = MockProvisioner::spawn_with(fast_mock_options()).await.unwrap();
    let client = Arc::new(Client::new(mock.url()).unwrap());

    let mut recorder =
        EventRecorder::new("http://127.0.0.1:21851", OWNER, RecordMask::INSTALLATION);
    let mut sink = WebhookSink::new("http://127.0.0.1:21852", OWNER);
    recorder.start(&client).await.unwrap();
    sink.start(&client).await.unwrap();

    let (cluster, installation) = suites(&client, &sink, &mock.url());
    let mut workflow = installation_lifecycle_workflow(&cluster, &installation).unwrap();
    workflow.run(CancellationToken::new()).await.unwrap();

    let installation_id = installation.installation_id();
    assert!(!installation_id.is_empty());
    assert!(!installation.cluster_installation_id().is_empty());
    assert_eq!(
        mock.installation(&installation_id).unwrap().state,
        installation_state::DELETED
    );

    // The export step recorded the connection string and counts.
    assert!(installation.connection_string().contains(SOURCE_DB_ID));
    let stats = installation.export_stats().unwrap();
    assert_eq!(
        stats,
        ExportStats {
            teams: 1,
            channels: 2,
            users: 2,
            posts: 3,
            direct_channels: 1,
            direct_posts: 2,
        }
    );

    // creation (3) + hibernation (2) + wake-up (2) + deletion (6)
    let expected = workflow.expected_events().unwrap();
    assert_eq!(expected.len(), 13);
    recorder.verify_in_order(expected).unwrap();

    // Cleanup after the in-workflow deletion is a no-op.
    installation.cleanup().await.unwrap();
    cluster.cleanup().await.unwrap();

    sink.shutdown(&client).await;
    recorder.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn cleanup_deletes_a_live_installation_idempotently() {
    let mock = MockProvisioner::spawn_with(fast_mock_options()).await.unwrap();
    let client = Arc::new(Client::new(mock.url()).unwrap());

    let mut sink = WebhookSink::new("http://127.0.0.1:21853", OWNER);
    sink.start(&client).await.unwrap();

    let (cluster, installation) = suites(&client, &sink, &mock.url());
    cluster.create_cluster().await.unwrap();
    installation.create_installation_custom_size().await.unwrap();

    let installation_id = installation.installation_id();
    let created = mock.installation(&installation_id).unwrap();
    assert_eq!(created.state, installation_state::STABLE);
    assert_eq!(created.size, "1000users");

    // First cleanup walks the deletion-pending chain; the second sees a
    // deleted installation and no-ops.
    installation.cleanup().await.unwrap();
    assert_eq!(
        mock.installation(&installation_id).unwrap().state,
        installation_state::DELETED
    );
    installation.cleanup().await.unwrap();

    cluster.cleanup().await.unwrap();
    sink.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn versioned_filestore_variant_applies_override() {
    let mock = MockProvisioner::spawn_with(fast_mock_options()).await.unwrap();
    let client = Arc::new(Client::new(mock.url()).unwrap());

    let mut sink = WebhookSink::new("http://127.0.0.1:21854", OWNER);
    sink.start(&client).await.unwrap();

    let (_cluster, installation) = suites(&client, &sink, &mock.url());
    installation
        .create_installation_versioned_filestore()
        .await
        .unwrap();

    let created = mock.installation(&installation.installation_id()).unwrap();
    assert_eq!(
        created.filestore,
        skiff_client::models::filestore_type::MULTI_TENANT_S3_VERSIONED
    );

    installation.cleanup().await.unwrap();
    sink.shutdown(&client).await;
    mock.shutdown().await;
}

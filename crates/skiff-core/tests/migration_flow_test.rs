//! Database migration workflows (rollback and commit) against the mock
//! provisioning API.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use skiff_client::Client;
use skiff_core::events::RecordMask;
use skiff_core::events::recorder::EventRecorder;
use skiff_core::harness::db_migration_workflow;
use skiff_core::suites::cluster::{ClusterSuite, ClusterSuiteParams};
use skiff_core::suites::installation::{InstallationSuite, InstallationSuiteParams};
use skiff_core::suites::migration::{DbMigrationSuite, DbMigrationSuiteParams};
use skiff_core::webhook::WebhookSink;
use skiff_test_utils::{
    DESTINATION_DB_ID, FixtureFileCopier, MockOptions, MockProvisioner, SAMPLE_EXPORT, SOURCE_DB_ID,
};

const OWNER: &str = "skiff-e2e";

fn fast_mock_options() -> MockOptions {
    MockOptions {
        transition_delay: Duration::from_millis(20),
        delivery_timeout: Duration::from_millis(500),
    }
}

struct Fixture {
    cluster: Arc<ClusterSuite>,
    installation: Arc<InstallationSuite>,
    migration: Arc<DbMigrationSuite>,
}

fn fixture(client: &Arc<Client>, sink: &WebhookSink, mock_url: &str) -> Fixture {
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
                ping_base_url: Some(mock_url.to_string()),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let migration = Arc::new(DbMigrationSuite::new(
        Arc::clone(client),
        Arc::clone(&installation),
        DbMigrationSuiteParams {
            destination_db_id: DESTINATION_DB_ID.to_string(),
            poll_interval: Duration::from_millis(20),
        },
    ));
    Fixture {
        cluster,
        installation,
        migration,
    }
}

#[tokio::test]
async fn migration_rollback_restores_source_database() {
    let mock = MockProvisioner::spawn_with(fast_mock_options()).await.unwrap();
    let client = Arc::new(Client::new(mock.url()).unwrap());

    let mut recorder =
        EventRecorder::new("http://127.0.0.1:21861", OWNER, RecordMask::INSTALLATION);
    let mut sink = WebhookSink::new("http://127.0.0.1:21862", OWNER);
    recorder.start(&client).await.unwrap();
    sink.start(&client).await.unwrap();

    let f = fixture(&client, &sink, &mock.url());
    let mut workflow =
        db_migration_workflow(&f.cluster, &f.installation, &f.migration, false).unwrap();
    workflow.run(CancellationToken::new()).await.unwrap();

    let installation_id = f.installation.installation_id();
    assert_eq!(f.migration.source_db_id(), SOURCE_DB_ID);

    // Rolled back: the installation lives on the source database again and
    // the connection string is the original one.
    let connection_string = mock.connection_string(&installation_id).unwrap();
    assert!(connection_string.contains(SOURCE_DB_ID));
    assert!(
        mock.database(SOURCE_DB_ID)
            .unwrap()
            .installation_ids
            .contains(&installation_id)
    );
    assert!(
        !mock
            .database(DESTINATION_DB_ID)
            .unwrap()
            .installation_ids
            .contains(&installation_id)
    );

    // Only the creation events touch the installation's state machine.
    let expected = workflow.expected_events().unwrap();
    assert_eq!(expected.len(), 3);
    recorder.verify_in_order(expected).unwrap();

    f.installation.cleanup().await.unwrap();
    f.cluster.cleanup().await.unwrap();
    sink.shutdown(&client).await;
    recorder.shutdown(&client).await;
    mock.shutdown().await;
}

#[tokio::test]
async fn migration_commit_keeps_destination_database() {
    let mock = MockProvisioner::spawn_with(fast_mock_options()).await.unwrap();
    let client = Arc::new(Client::new(mock.url()).unwrap());

    let mut sink = WebhookSink::new("http://127.0.0.1:21863", OWNER);
    sink.start(&client).await.unwrap();

    let f = fixture(&client, &sink, &mock.url());
    let mut workflow =
        db_migration_workflow(&f.cluster, &f.installation, &f.migration, true).unwrap();
    workflow.run(CancellationToken::new()).await.unwrap();

    let installation_id = f.installation.installation_id();
    let connection_string = mock.connection_string(&installation_id).unwrap();
    assert!(connection_string.contains(DESTINATION_DB_ID));
    assert!(
        mock.database(DESTINATION_DB_ID)
            .unwrap()
            .installation_ids
            .contains(&installation_id)
    );

    f.installation.cleanup().await.unwrap();
    f.cluster.cleanup().await.unwrap();
    sink.shutdown(&client).await;
    mock.shutdown().await;
}

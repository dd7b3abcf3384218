//! Composition root: builds suites, servers, and workflows for the shipped
//! test flows and runs them end to end.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use skiff_client::Client;

use crate::config::HarnessConfig;
use crate::events::recorder::EventRecorder;
use crate::events::{EventOccurrence, RecordMask};
use crate::kube::KubectlCopier;
use crate::notify::{ResultNotification, send_result_notification};
use crate::suites::cluster::{ClusterSuite, ClusterSuiteParams};
use crate::suites::installation::{InstallationSuite, InstallationSuiteParams};
use crate::suites::migration::{DbMigrationSuite, DbMigrationSuiteParams};
use crate::webhook::WebhookSink;
use crate::workflow::{Step, Workflow, WorkflowError};

/// Owner recorded on subscriptions and webhooks. Stable across runs so
/// registrations are reused instead of accumulating.
pub const OWNER_ID: &str = "skiff-e2e";

/// The test flows the harness ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFlow {
    ClusterLifecycle,
    InstallationLifecycle,
    DbMigration { commit: bool },
}

impl TestFlow {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClusterLifecycle => "cluster-lifecycle",
            Self::InstallationLifecycle => "installation-lifecycle",
            Self::DbMigration { .. } => "db-migration",
        }
    }
}

/// Wrap a suite method as a workflow step action.
fn step<S, F, Fut>(name: &'static str, suite: &Arc<S>, run: F) -> Step
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let suite = Arc::clone(suite);
    Step::new(name, move |_ctx| run(Arc::clone(&suite)).boxed())
}

/// Wrap a suite event provider for [`Step::expected_events`].
fn expected<S>(
    suite: Arc<S>,
    provider: fn(&S) -> Vec<EventOccurrence>,
) -> impl Fn() -> Vec<EventOccurrence> + Send + Sync + 'static
where
    S: Send + Sync + 'static,
{
    move || provider(&suite)
}

/// Full cluster lifecycle: create, reprovision, resize (when enabled),
/// delete, verifying the cluster event stream.
pub fn cluster_lifecycle_workflow(cluster: &Arc<ClusterSuite>) -> Result<Workflow, WorkflowError> {
    let mut workflow = Workflow::new("cluster-lifecycle");
    workflow.add_step(
        step("create-cluster", cluster, |s| async move { s.create_cluster().await })
            .expected_events(expected(Arc::clone(cluster), ClusterSuite::creation_events)),
    )?;
    workflow.add_step(
        step("provision-cluster", cluster, |s| async move { s.provision_cluster().await })
            .depends_on(&["create-cluster"])
            .expected_events(expected(Arc::clone(cluster), ClusterSuite::provisioning_events)),
    )?;
    workflow.add_step(
        step("resize-cluster", cluster, |s| async move { s.resize_cluster().await })
            .depends_on(&["provision-cluster"])
            .expected_events(expected(Arc::clone(cluster), ClusterSuite::resize_events)),
    )?;
    workflow.add_step(
        step("check-cluster-resize", cluster, |s| async move {
            s.check_cluster_resize().await
        })
        .depends_on(&["resize-cluster"]),
    )?;
    workflow.add_step(
        step("delete-cluster", cluster, |s| async move { s.delete_cluster().await })
            .depends_on(&["check-cluster-resize"])
            .expected_events(expected(Arc::clone(cluster), ClusterSuite::deletion_events)),
    )?;
    Ok(workflow)
}

/// Shared prefix of the installation-based flows: a cluster, an
/// installation on it, sample data, and the recorded export baseline.
fn add_installation_setup_steps(
    workflow: &mut Workflow,
    cluster: &Arc<ClusterSuite>,
    installation: &Arc<InstallationSuite>,
) -> Result<(), WorkflowError> {
    workflow.add_step(step("create-cluster", cluster, |s| async move {
        s.create_cluster().await
    }))?;
    workflow.add_step(
        step("create-installation", installation, |s| async move {
            s.create_installation().await
        })
        .depends_on(&["create-cluster"])
        .expected_events(expected(Arc::clone(installation), InstallationSuite::creation_events)),
    )?;
    workflow.add_step(
        step("get-cluster-installation", installation, |s| async move {
            s.get_cluster_installation().await
        })
        .depends_on(&["create-installation"]),
    )?;
    workflow.add_step(
        step("check-cluster-installation-status", installation, |s| async move {
            s.check_cluster_installation_status().await
        })
        .depends_on(&["get-cluster-installation"]),
    )?;
    workflow.add_step(
        step("populate-sample-data", installation, |s| async move {
            s.populate_sample_data().await
        })
        .depends_on(&["check-cluster-installation-status"]),
    )?;
    workflow.add_step(
        step("export-data", installation, |s| async move {
            s.get_connection_str_and_export().await
        })
        .depends_on(&["populate-sample-data"]),
    )?;
    Ok(())
}

/// Full installation lifecycle on a fresh cluster: create, exercise,
/// hibernate and wake, delete, verifying the installation event stream.
pub fn installation_lifecycle_workflow(
    cluster: &Arc<ClusterSuite>,
    installation: &Arc<InstallationSuite>,
) -> Result<Workflow, WorkflowError> {
    let mut workflow = Workflow::new("installation-lifecycle");
    add_installation_setup_steps(&mut workflow, cluster, installation)?;
    workflow.add_step(
        step("check-health", installation, |s| async move { s.check_health().await })
            .depends_on(&["export-data"]),
    )?;
    workflow.add_step(
        step("hibernate-installation", installation, |s| async move {
            s.hibernate_installation().await
        })
        .depends_on(&["check-health"])
        .expected_events(expected(Arc::clone(installation), InstallationSuite::hibernation_events)),
    )?;
    workflow.add_step(
        step("wake-up-installation", installation, |s| async move {
            s.wake_up_installation().await
        })
        .depends_on(&["hibernate-installation"])
        .expected_events(expected(Arc::clone(installation), InstallationSuite::wake_up_events)),
    )?;
    workflow.add_step(
        step("delete-installation", installation, |s| async move {
            s.delete_installation().await
        })
        .depends_on(&["wake-up-installation"])
        .expected_events(expected(Arc::clone(installation), InstallationSuite::deletion_events)),
    )?;
    Ok(workflow)
}

/// Database migration flow: migrate the installation to the destination
/// database, verify data preservation, then either commit or roll back.
pub fn db_migration_workflow(
    cluster: &Arc<ClusterSuite>,
    installation: &Arc<InstallationSuite>,
    migration: &Arc<DbMigrationSuite>,
    commit: bool,
) -> Result<Workflow, WorkflowError> {
    let mut workflow = Workflow::new("db-migration");
    add_installation_setup_steps(&mut workflow, cluster, installation)?;
    workflow.add_step(
        step("get-multitenant-db", migration, |s| async move {
            s.get_multitenant_db_id().await
        })
        .depends_on(&["export-data"]),
    )?;
    workflow.add_step(
        step("run-db-migration", migration, |s| async move {
            s.run_db_migration().await
        })
        .depends_on(&["get-multitenant-db"]),
    )?;
    workflow.add_step(
        step("assert-migration-successful", migration, |s| async move {
            s.assert_migration_successful().await
        })
        .depends_on(&["run-db-migration"]),
    )?;
    if commit {
        workflow.add_step(
            step("commit-migration", migration, |s| async move {
                s.commit_migration().await
            })
            .depends_on(&["assert-migration-successful"]),
        )?;
    } else {
        workflow.add_step(
            step("rollback-migration", migration, |s| async move {
                s.rollback_migration().await
            })
            .depends_on(&["assert-migration-successful"]),
        )?;
        workflow.add_step(
            step("assert-rollback-successful", migration, |s| async move {
                s.assert_rollback_successful().await
            })
            .depends_on(&["rollback-migration"]),
        )?;
    }
    Ok(workflow)
}

/// One end-to-end test run: servers, suites, workflow, verification,
/// cleanup, notification.
pub struct Harness {
    config: HarnessConfig,
    client: Arc<Client>,
    recorder: EventRecorder,
    sink: WebhookSink,
    workflow: Workflow,
    cluster_suite: Arc<ClusterSuite>,
    installation_suite: Option<Arc<InstallationSuite>>,
    test_id: String,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("test_id", &self.test_id)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Assemble everything a flow needs from the environment config.
    pub fn build(config: HarnessConfig, flow: TestFlow) -> Result<Self> {
        let client = Arc::new(Client::new(&config.provisioner_url)?);
        let sink = WebhookSink::new(&config.webhook_listen_url, OWNER_ID);
        let webhooks = sink.channel();

        // The mask keeps resource types the flow does not verify out of the
        // history, so unrelated supervisor chatter cannot fail verification.
        let mask = match flow {
            TestFlow::ClusterLifecycle => RecordMask::CLUSTER,
            TestFlow::InstallationLifecycle | TestFlow::DbMigration { .. } => {
                RecordMask::INSTALLATION
            }
        };
        let recorder = EventRecorder::new(&config.event_listen_url, OWNER_ID, mask);

        let mut cluster_suite = ClusterSuite::new(
            Arc::clone(&client),
            Arc::clone(&webhooks),
            ClusterSuiteParams {
                ami: config.ami.clone(),
                vpc: config.vpc.clone(),
                provisioner_role_arn: config.provisioner_role_arn.clone(),
                allow_resize: config.allow_resize,
                ..Default::default()
            },
        );
        if let Some(cluster_id) = &config.existing_cluster_id {
            cluster_suite = cluster_suite.with_existing_cluster(cluster_id);
        }
        let cluster_suite = Arc::new(cluster_suite);

        let build_installation = || -> Result<Arc<InstallationSuite>> {
            let mut suite = InstallationSuite::new(
                Arc::clone(&client),
                Arc::clone(&webhooks),
                Arc::new(KubectlCopier::default()),
                InstallationSuiteParams {
                    owner_id: OWNER_ID.to_string(),
                    dns_subdomain: config.dns_subdomain.clone(),
                    database_type: config.database_type.clone(),
                    filestore_type: config.filestore_type.clone(),
                    ..Default::default()
                },
            )?;
            if let Some(installation_id) = &config.existing_installation_id {
                suite = suite.with_existing_installation(installation_id);
            }
            Ok(Arc::new(suite))
        };

        let (installation_suite, workflow) = match flow {
            TestFlow::ClusterLifecycle => (None, cluster_lifecycle_workflow(&cluster_suite)?),
            TestFlow::InstallationLifecycle => {
                let installation = build_installation()?;
                let workflow = installation_lifecycle_workflow(&cluster_suite, &installation)?;
                (Some(installation), workflow)
            }
            TestFlow::DbMigration { commit } => {
                let destination_db_id = config
                    .destination_db_id
                    .clone()
                    .context("SKIFF_DESTINATION_DB must be set for the db-migration workflow")?;
                let installation = build_installation()?;
                let migration = Arc::new(DbMigrationSuite::new(
                    Arc::clone(&client),
                    Arc::clone(&installation),
                    DbMigrationSuiteParams::new(destination_db_id),
                ));
                let workflow =
                    db_migration_workflow(&cluster_suite, &installation, &migration, commit)?;
                (Some(installation), workflow)
            }
        };

        Ok(Self {
            config,
            client,
            recorder,
            sink,
            workflow,
            cluster_suite,
            installation_suite,
            test_id: format!("skiff-{}", Uuid::new_v4().simple()),
        })
    }

    /// Override the per-step attempt budget of the workflow.
    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.workflow = self.workflow.with_retry_attempts(attempts);
        self
    }

    /// Run the workflow, verify the recorded events, clean up, shut the
    /// servers down, and post the result notification. Returns an error
    /// when the workflow or the verification failed.
    pub async fn run(mut self) -> Result<()> {
        let started_at = Utc::now();
        tracing::info!(
            test_id = %self.test_id,
            workflow = %self.workflow.name(),
            "starting e2e run"
        );

        self.recorder
            .start(&self.client)
            .await
            .context("failed to start event recorder")?;
        if let Err(err) = self.sink.start(&self.client).await {
            self.recorder.shutdown(&self.client).await;
            return Err(err.context("failed to start webhook sink"));
        }

        let run_result = self.workflow.run(CancellationToken::new()).await;

        // Verification only means something when every step ran.
        let verify_result = match &run_result {
            Ok(()) => self
                .workflow
                .expected_events()
                .map_err(anyhow::Error::from)
                .and_then(|exp| {
                    self.recorder
                        .verify_in_order(exp)
                        .map_err(anyhow::Error::from)
                }),
            Err(_) => Ok(()),
        };

        if self.config.cleanup {
            if let Some(installation) = &self.installation_suite {
                if let Err(err) = installation.cleanup().await {
                    tracing::error!(error = %format!("{err:#}"), "installation cleanup failed");
                }
            }
            if let Err(err) = self.cluster_suite.cleanup().await {
                tracing::error!(error = %format!("{err:#}"), "cluster cleanup failed");
            }
        } else {
            tracing::info!("cleanup disabled, leaving resources in place");
        }

        self.sink.shutdown(&self.client).await;
        self.recorder.shutdown(&self.client).await;

        let passed = run_result.is_ok() && verify_result.is_ok();
        self.notify(passed, started_at).await;

        run_result.map_err(anyhow::Error::from)?;
        verify_result?;
        tracing::info!(test_id = %self.test_id, "e2e run passed");
        Ok(())
    }

    async fn notify(&self, passed: bool, started_at: chrono::DateTime<Utc>) {
        let Some(url) = &self.config.notification_url else {
            return;
        };
        let notification = ResultNotification {
            test_id: self.test_id.clone(),
            workflow: self.workflow.name().to_string(),
            passed,
            cluster_id: self.cluster_suite.cluster_id(),
            installation_id: self
                .installation_suite
                .as_ref()
                .map(|s| s.installation_id())
                .unwrap_or_default(),
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(err) = send_result_notification(url, &notification).await {
            tracing::warn!(error = %format!("{err:#}"), "failed to post result notification");
        }
    }
}

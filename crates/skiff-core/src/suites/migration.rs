//! Database migration operations layered on the installation suite.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};

use skiff_client::api::databases;
use skiff_client::models::{
    InstallationDbMigrationOperation, MigrateDatabaseRequest, migration_state,
};
use skiff_client::Client;

use super::installation::{ExportStats, InstallationSuite};
use super::{DEFAULT_POLL_INTERVAL, MIGRATION_TIMEOUT, ROLLBACK_TIMEOUT, poll_until_state};
use crate::wait::WaitConfig;

/// Immutable parameters for a migration suite.
#[derive(Debug, Clone)]
pub struct DbMigrationSuiteParams {
    /// Multitenant database the installation is migrated onto.
    pub destination_db_id: String,
    pub poll_interval: Duration,
}

impl DbMigrationSuiteParams {
    pub fn new(destination_db_id: impl Into<String>) -> Self {
        Self {
            destination_db_id: destination_db_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Metadata accumulated as migration steps succeed.
#[derive(Debug, Default)]
pub struct MigrationMeta {
    /// Multitenant database hosting the installation before migration.
    pub source_db_id: String,
    pub operation_id: String,
    pub original_connection_string: String,
    pub original_export_stats: Option<ExportStats>,
}

/// Migration operations for workflow steps. The installation suite supplies
/// the pre-migration connection string and export statistics the assertions
/// compare against.
pub struct DbMigrationSuite {
    client: Arc<Client>,
    installation: Arc<InstallationSuite>,
    params: DbMigrationSuiteParams,
    meta: Mutex<MigrationMeta>,
}

impl DbMigrationSuite {
    pub fn new(
        client: Arc<Client>,
        installation: Arc<InstallationSuite>,
        params: DbMigrationSuiteParams,
    ) -> Self {
        Self {
            client,
            installation,
            params,
            meta: Mutex::new(MigrationMeta::default()),
        }
    }

    pub fn source_db_id(&self) -> String {
        self.meta.lock().expect("migration meta lock poisoned").source_db_id.clone()
    }

    fn operation_id(&self) -> String {
        self.meta.lock().expect("migration meta lock poisoned").operation_id.clone()
    }

    fn originals(&self) -> (String, Option<ExportStats>) {
        let meta = self.meta.lock().expect("migration meta lock poisoned");
        (
            meta.original_connection_string.clone(),
            meta.original_export_stats.clone(),
        )
    }

    async fn fetch_operation(&self, operation_id: &str) -> Result<InstallationDbMigrationOperation> {
        databases::get_migration_operation(&self.client, operation_id)
            .await
            .with_context(|| format!("failed to get migration operation {operation_id}"))?
            .with_context(|| format!("migration operation {operation_id} not found"))
    }

    /// Find the multitenant database currently hosting the installation and
    /// snapshot the pre-migration connection string and export statistics.
    pub async fn get_multitenant_db_id(&self) -> Result<()> {
        let installation_id = self.installation.installation_id();
        let databases = databases::list_multitenant_databases(&self.client)
            .await
            .context("failed to list multitenant databases")?;

        let Some(source) = databases
            .into_iter()
            .find(|db| db.installation_ids.iter().any(|id| *id == installation_id))
        else {
            bail!("no multitenant database hosts installation {installation_id}");
        };
        ensure!(
            source.id != self.params.destination_db_id,
            "installation {installation_id} already lives on destination database {}",
            self.params.destination_db_id
        );

        let connection_string = self.installation.connection_string();
        ensure!(
            !connection_string.is_empty(),
            "connection string not recorded; the export step must run before migration"
        );
        let export_stats = self.installation.export_stats().with_context(|| {
            "export statistics not recorded; the export step must run before migration".to_string()
        })?;

        tracing::info!(source_db_id = %source.id, "recorded source multitenant database");
        let mut meta = self.meta.lock().expect("migration meta lock poisoned");
        meta.source_db_id = source.id;
        meta.original_connection_string = connection_string;
        meta.original_export_stats = Some(export_stats);
        Ok(())
    }

    /// Start the migration and poll the operation until it succeeds.
    pub async fn run_db_migration(&self) -> Result<()> {
        let installation_id = self.installation.installation_id();
        let operation = databases::migrate_database(
            &self.client,
            &MigrateDatabaseRequest {
                installation_id: installation_id.clone(),
                destination_database_id: self.params.destination_db_id.clone(),
            },
        )
        .await
        .with_context(|| format!("failed to start database migration of {installation_id}"))?;
        tracing::info!(operation_id = %operation.id, "started database migration");
        self.meta.lock().expect("migration meta lock poisoned").operation_id =
            operation.id.clone();

        self.poll_operation(
            &operation.id,
            migration_state::SUCCEEDED,
            MIGRATION_TIMEOUT,
        )
        .await
    }

    async fn poll_operation(
        &self,
        operation_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<()> {
        let client = Arc::clone(&self.client);
        poll_until_state(
            &WaitConfig::new(timeout, self.params.poll_interval),
            &format!("migration operation {operation_id}"),
            &[target],
            &[migration_state::FAILED],
            || {
                let client = Arc::clone(&client);
                let id = operation_id.to_string();
                async move {
                    let operation = databases::get_migration_operation(&client, &id)
                        .await
                        .with_context(|| format!("failed to get migration operation {id}"))?
                        .with_context(|| format!("migration operation {id} not found"))?;
                    Ok(operation.state)
                }
            },
        )
        .await?;
        Ok(())
    }

    /// After a successful migration the installation must point at the
    /// destination database and its data must be intact.
    pub async fn assert_migration_successful(&self) -> Result<()> {
        let (original_connection_string, original_stats) = self.originals();
        let connection_string = self.installation.fetch_connection_string().await?;

        ensure!(
            connection_string != original_connection_string,
            "connection string did not change after migration"
        );
        ensure!(
            connection_string.contains(&self.params.destination_db_id),
            "connection string {connection_string:?} does not reference destination database {}",
            self.params.destination_db_id
        );

        let stats = self.installation.collect_export_stats().await?;
        let original_stats =
            original_stats.context("original export statistics missing")?;
        ensure!(
            stats == original_stats,
            "bulk-export counts changed across migration: before {original_stats:?}, after {stats:?}"
        );
        Ok(())
    }

    /// Commit the migration, making the destination permanent.
    pub async fn commit_migration(&self) -> Result<()> {
        let operation_id = self.operation_id();
        let operation = databases::commit_migration(&self.client, &operation_id)
            .await
            .with_context(|| format!("failed to commit migration operation {operation_id}"))?;
        ensure!(
            operation.state == migration_state::COMMITTED,
            "migration operation {operation_id} is {:?} after commit, expected {:?}",
            operation.state,
            migration_state::COMMITTED
        );
        Ok(())
    }

    /// Roll the migration back to the source database. A no-op when the
    /// rollback already finished.
    pub async fn rollback_migration(&self) -> Result<()> {
        let operation_id = self.operation_id();
        let operation = self.fetch_operation(&operation_id).await?;
        if operation.state == migration_state::ROLLBACK_FINISHED {
            return Ok(());
        }
        ensure!(
            operation.state == migration_state::SUCCEEDED,
            "migration operation {operation_id} is {:?}, cannot roll back",
            operation.state
        );

        let operation = databases::rollback_migration(&self.client, &operation_id)
            .await
            .with_context(|| format!("failed to roll back migration operation {operation_id}"))?;
        ensure!(
            operation.state == migration_state::ROLLBACK_REQUESTED,
            "migration operation {operation_id} is {:?} after rollback request, expected {:?}",
            operation.state,
            migration_state::ROLLBACK_REQUESTED
        );

        self.poll_operation(
            &operation_id,
            migration_state::ROLLBACK_FINISHED,
            ROLLBACK_TIMEOUT,
        )
        .await
    }

    /// After a rollback the original connection string and data must be
    /// back exactly.
    pub async fn assert_rollback_successful(&self) -> Result<()> {
        let (original_connection_string, original_stats) = self.originals();
        let connection_string = self.installation.fetch_connection_string().await?;

        ensure!(
            connection_string == original_connection_string,
            "connection string {connection_string:?} differs from pre-migration value after rollback"
        );
        let source_db_id = self.source_db_id();
        ensure!(
            connection_string.contains(&source_db_id),
            "connection string {connection_string:?} does not reference source database {source_db_id}"
        );

        let stats = self.installation.collect_export_stats().await?;
        let original_stats =
            original_stats.context("original export statistics missing")?;
        ensure!(
            stats == original_stats,
            "bulk-export counts changed across rollback: before {original_stats:?}, after {stats:?}"
        );
        Ok(())
    }
}

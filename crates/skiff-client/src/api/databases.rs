//! Multitenant database listing and migration operations.

use crate::client::Client;
use crate::error::ClientError;
use crate::models::{
    InstallationDbMigrationOperation, MigrateDatabaseRequest, MultitenantDatabase,
};

pub async fn list_multitenant_databases(
    client: &Client,
) -> Result<Vec<MultitenantDatabase>, ClientError> {
    client.get_json("/api/databases").await
}

/// Start migrating an installation's database to another multitenant
/// database cluster. Progress is tracked on the returned operation.
pub async fn migrate_database(
    client: &Client,
    request: &MigrateDatabaseRequest,
) -> Result<InstallationDbMigrationOperation, ClientError> {
    client.post_json("/api/migrations", request).await
}

pub async fn get_migration_operation(
    client: &Client,
    operation_id: &str,
) -> Result<Option<InstallationDbMigrationOperation>, ClientError> {
    client
        .get_json_optional(&format!("/api/migration/{operation_id}"))
        .await
}

/// Commit a succeeded migration, making the destination database permanent.
pub async fn commit_migration(
    client: &Client,
    operation_id: &str,
) -> Result<InstallationDbMigrationOperation, ClientError> {
    client
        .post_json(&format!("/api/migration/{operation_id}/commit"), &())
        .await
}

/// Roll a succeeded migration back to the source database.
pub async fn rollback_migration(
    client: &Client,
    operation_id: &str,
) -> Result<InstallationDbMigrationOperation, ClientError> {
    client
        .post_json(&format!("/api/migration/{operation_id}/rollback"), &())
        .await
}

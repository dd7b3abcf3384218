use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Resource types
// ---------------------------------------------------------------------------

/// The kind of resource a state-change notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cluster,
    Installation,
    ClusterInstallation,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cluster => "cluster",
            Self::Installation => "installation",
            Self::ClusterInstallation => "cluster_installation",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceType {
    type Err = ResourceTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(Self::Cluster),
            "installation" => Ok(Self::Installation),
            "cluster_installation" => Ok(Self::ClusterInstallation),
            other => Err(ResourceTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ResourceType`] string.
#[derive(Debug, Clone)]
pub struct ResourceTypeParseError(pub String);

impl fmt::Display for ResourceTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid resource type: {:?}", self.0)
    }
}

impl std::error::Error for ResourceTypeParseError {}

// ---------------------------------------------------------------------------
// State constants
// ---------------------------------------------------------------------------
//
// Resource states travel as opaque strings owned by the control plane; new
// states appear without a client release. Comparisons therefore happen on
// string constants rather than a closed enum.

/// States a cluster moves through.
pub mod cluster_state {
    /// Placeholder old-state for a freshly created resource.
    pub const NONE: &str = "n/a";
    pub const CREATION_REQUESTED: &str = "creation-requested";
    pub const PROVISION_IN_PROGRESS: &str = "provision-in-progress";
    pub const PROVISIONING_REQUESTED: &str = "provisioning-requested";
    pub const RESIZE_REQUESTED: &str = "resize-requested";
    pub const STABLE: &str = "stable";
    pub const DELETION_REQUESTED: &str = "deletion-requested";
    pub const DELETED: &str = "deleted";
    pub const CREATION_FAILED: &str = "creation-failed";
    pub const PROVISIONING_FAILED: &str = "provisioning-failed";
    pub const DELETION_FAILED: &str = "deletion-failed";
}

/// States an installation moves through.
pub mod installation_state {
    pub const NONE: &str = "n/a";
    pub const CREATION_REQUESTED: &str = "creation-requested";
    pub const CREATION_IN_PROGRESS: &str = "creation-in-progress";
    pub const STABLE: &str = "stable";
    pub const UPDATE_IN_PROGRESS: &str = "update-in-progress";
    pub const HIBERNATION_REQUESTED: &str = "hibernation-requested";
    pub const HIBERNATING: &str = "hibernating";
    pub const WAKE_UP_REQUESTED: &str = "wake-up-requested";
    pub const DELETION_PENDING_REQUESTED: &str = "deletion-pending-requested";
    pub const DELETION_PENDING_IN_PROGRESS: &str = "deletion-pending-in-progress";
    pub const DELETION_PENDING: &str = "deletion-pending";
    pub const DELETION_REQUESTED: &str = "deletion-requested";
    pub const DELETION_IN_PROGRESS: &str = "deletion-in-progress";
    pub const DELETED: &str = "deleted";
    pub const CREATION_FAILED: &str = "creation-failed";
    pub const DELETION_FAILED: &str = "deletion-failed";
}

/// States a cluster installation moves through.
pub mod cluster_installation_state {
    pub const NONE: &str = "n/a";
    pub const CREATION_REQUESTED: &str = "creation-requested";
    pub const RECONCILING: &str = "reconciling";
    pub const READY: &str = "ready";
    pub const STABLE: &str = "stable";
    pub const DELETION_REQUESTED: &str = "deletion-requested";
    pub const DELETED: &str = "deleted";
}

/// States of a database migration operation. These use the control plane's
/// operation-state casing, which differs from resource states.
pub mod migration_state {
    pub const REQUESTED: &str = "Requested";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const COMMITTED: &str = "Committed";
    pub const ROLLBACK_REQUESTED: &str = "RollbackRequested";
    pub const ROLLBACK_FINISHED: &str = "RollbackFinished";
}

/// Provisioner backends. The legacy provisioner patches node instance types
/// in place; newer backends resize through node-group replacement.
pub mod provisioner {
    pub const LEGACY: &str = "kops";
    pub const MANAGED: &str = "eks";
}

/// Database backends an installation can be created with.
pub mod database_type {
    pub const SINGLE_TENANT_RDS: &str = "aws-rds-postgres";
    pub const MULTI_TENANT_RDS: &str = "aws-multitenant-rds-postgres";
}

/// Filestore backends an installation can be created with.
pub mod filestore_type {
    pub const SINGLE_TENANT_S3: &str = "aws-s3";
    pub const MULTI_TENANT_S3: &str = "aws-multitenant-s3";
    pub const MULTI_TENANT_S3_VERSIONED: &str = "aws-multitenant-s3-versioned";
}

// ---------------------------------------------------------------------------
// Inbound notification payloads
// ---------------------------------------------------------------------------

/// State-change event delivered to a subscription endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEventPayload {
    #[serde(default)]
    pub event_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub old_state: String,
    pub new_state: String,
    #[serde(default)]
    pub timestamp: i64,
    /// Publisher metadata this client does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Lifecycle webhook delivered to a registered webhook endpoint. Distinct
/// from [`StateChangeEventPayload`]: webhooks are the older delivery channel
/// and carry the resource type under `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub id: String,
    pub old_state: String,
    pub new_state: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub state: String,
    pub provisioner: String,
    #[serde(default)]
    pub node_instance_type: String,
    #[serde(default)]
    pub allow_installations: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub provider: String,
    pub provisioner: String,
    pub node_instance_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ami: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioner_role_arn: Option<String>,
    pub allow_installations: bool,
}

/// Patch for an existing cluster; only set fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchClusterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_instance_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionClusterRequest {
    /// Utility versions to converge on, keyed by utility name. `None` keeps
    /// whatever the cluster currently runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_utility_versions: Option<serde_json::Map<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Installations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    pub state: String,
    pub dns: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub filestore: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub version: String,
    /// Epoch millis after which a deletion-pending installation is deleted.
    #[serde(default)]
    pub deletion_pending_expiry: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstallationRequest {
    pub owner_id: String,
    pub dns: String,
    pub database: String,
    pub filestore: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchDeletionPendingExpiryRequest {
    /// Epoch millis.
    pub deletion_pending_expiry: i64,
}

// ---------------------------------------------------------------------------
// Cluster installations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInstallation {
    pub id: String,
    pub cluster_id: String,
    pub installation_id: String,
    pub state: String,
}

/// Command to run inside the cluster installation's application container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

// ---------------------------------------------------------------------------
// Subscriptions and webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub owner_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub owner_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub owner_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhookRequest {
    pub owner_id: String,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Multitenant databases and migration operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitenantDatabase {
    pub id: String,
    #[serde(default)]
    pub database_type: String,
    /// IDs of the installations currently hosted on this database cluster.
    #[serde(default)]
    pub installation_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationDbMigrationOperation {
    pub id: String,
    pub installation_id: String,
    pub state: String,
    #[serde(default)]
    pub source_database_id: String,
    #[serde(default)]
    pub destination_database_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateDatabaseRequest {
    pub installation_id: String,
    pub destination_database_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_round_trips_through_display() {
        for rt in [
            ResourceType::Cluster,
            ResourceType::Installation,
            ResourceType::ClusterInstallation,
        ] {
            assert_eq!(rt.to_string().parse::<ResourceType>().unwrap(), rt);
        }
        assert!("pod".parse::<ResourceType>().is_err());
    }

    #[test]
    fn state_change_payload_tolerates_unknown_metadata() {
        let raw = r#"{
            "event_id": "ev-1",
            "resource_type": "cluster_installation",
            "resource_id": "ci-1",
            "old_state": "reconciling",
            "new_state": "stable",
            "timestamp": 1712000000000,
            "attempt": 3,
            "publisher": "supervisor-2"
        }"#;
        let payload: StateChangeEventPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.resource_type, ResourceType::ClusterInstallation);
        assert_eq!(payload.new_state, "stable");
        assert_eq!(payload.extra["publisher"], "supervisor-2");
    }

    #[test]
    fn webhook_payload_reads_type_field() {
        let raw = r#"{"type": "cluster", "id": "c1", "old_state": "n/a", "new_state": "creation-requested"}"#;
        let payload: WebhookPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.resource_type, ResourceType::Cluster);
        assert_eq!(payload.timestamp, 0);
    }
}

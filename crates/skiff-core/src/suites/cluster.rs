//! Cluster lifecycle operations and their expected event sequences.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use skiff_client::api::clusters;
use skiff_client::models::{
    Cluster, CreateClusterRequest, PatchClusterRequest, ProvisionClusterRequest, ResourceType,
    cluster_state, provisioner,
};
use skiff_client::Client;

use super::{CLUSTER_STATE_TIMEOUT, DEFAULT_POLL_INTERVAL, poll_until_state};
use crate::events::EventOccurrence;
use crate::wait::WaitConfig;
use crate::webhook::WebhookChannel;
use crate::webhook::waiter::{StateWaitRequest, wait_for_state};

/// Immutable parameters a cluster suite is constructed with.
#[derive(Debug, Clone)]
pub struct ClusterSuiteParams {
    pub provider: String,
    pub provisioner: String,
    pub node_instance_type: String,
    /// Instance type the resize phase patches the cluster to.
    pub resize_instance_type: String,
    pub ami: Option<String>,
    pub vpc: Option<String>,
    pub provisioner_role_arn: Option<String>,
    /// Gates the resize phase; disabled makes resize a no-op.
    pub allow_resize: bool,
    pub poll_interval: Duration,
}

impl Default for ClusterSuiteParams {
    fn default() -> Self {
        Self {
            provider: "aws".to_string(),
            provisioner: provisioner::LEGACY.to_string(),
            node_instance_type: "m5.large".to_string(),
            resize_instance_type: "m5.xlarge".to_string(),
            ami: None,
            vpc: None,
            provisioner_role_arn: None,
            allow_resize: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Metadata accumulated as cluster steps succeed.
#[derive(Debug, Default)]
pub struct ClusterMeta {
    pub cluster_id: String,
}

/// Cluster operations for workflow steps. Methods take `&self`: sequential
/// step execution is what keeps the metadata writes race-free.
pub struct ClusterSuite {
    client: Arc<Client>,
    webhooks: Arc<WebhookChannel>,
    params: ClusterSuiteParams,
    meta: Mutex<ClusterMeta>,
}

impl ClusterSuite {
    pub fn new(
        client: Arc<Client>,
        webhooks: Arc<WebhookChannel>,
        params: ClusterSuiteParams,
    ) -> Self {
        Self {
            client,
            webhooks,
            params,
            meta: Mutex::new(ClusterMeta::default()),
        }
    }

    /// Target an existing cluster instead of creating one.
    pub fn with_existing_cluster(self, cluster_id: impl Into<String>) -> Self {
        self.set_cluster_id(cluster_id.into());
        self
    }

    pub fn cluster_id(&self) -> String {
        self.meta.lock().expect("cluster meta lock poisoned").cluster_id.clone()
    }

    fn set_cluster_id(&self, cluster_id: String) {
        self.meta.lock().expect("cluster meta lock poisoned").cluster_id = cluster_id;
    }

    fn wait_config(&self, timeout: Duration) -> WaitConfig {
        WaitConfig::new(timeout, self.params.poll_interval)
    }

    async fn fetch_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        clusters::get_cluster(&self.client, cluster_id)
            .await
            .with_context(|| format!("failed to get cluster {cluster_id}"))?
            .with_context(|| format!("cluster {cluster_id} not found"))
    }

    /// Create the cluster unless an ID is already recorded, then wait for it
    /// to become stable. Safe to re-run: a second invocation skips the POST
    /// and only waits.
    pub async fn create_cluster(&self) -> Result<()> {
        if self.cluster_id().is_empty() {
            let request = CreateClusterRequest {
                provider: self.params.provider.clone(),
                provisioner: self.params.provisioner.clone(),
                node_instance_type: self.params.node_instance_type.clone(),
                ami: self.params.ami.clone(),
                vpc: self.params.vpc.clone(),
                provisioner_role_arn: self.params.provisioner_role_arn.clone(),
                allow_installations: true,
            };
            let cluster = clusters::create_cluster(&self.client, &request)
                .await
                .context("failed to request cluster creation")?;
            tracing::info!(cluster_id = %cluster.id, "requested cluster creation");
            self.set_cluster_id(cluster.id);
        }

        let cluster_id = self.cluster_id();
        let cluster = self.fetch_cluster(&cluster_id).await?;
        match cluster.state.as_str() {
            cluster_state::STABLE => return Ok(()),
            cluster_state::CREATION_FAILED | cluster_state::PROVISIONING_FAILED => {
                bail!("cluster {cluster_id} is in terminal state {:?}", cluster.state);
            }
            _ => {}
        }

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Cluster,
                resource_id: &cluster_id,
                target_state: cluster_state::STABLE,
                failure_states: &[cluster_state::CREATION_FAILED, cluster_state::PROVISIONING_FAILED],
                timeout: CLUSTER_STATE_TIMEOUT,
            },
        )
        .await
        .context("waiting for cluster to become stable")?;
        Ok(())
    }

    /// Reprovision the cluster's utilities and wait for stable.
    pub async fn provision_cluster(&self) -> Result<()> {
        let cluster_id = self.cluster_id();
        clusters::provision_cluster(
            &self.client,
            &cluster_id,
            &ProvisionClusterRequest::default(),
        )
        .await
        .with_context(|| format!("failed to request provisioning of cluster {cluster_id}"))?;

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Cluster,
                resource_id: &cluster_id,
                target_state: cluster_state::STABLE,
                failure_states: &[cluster_state::PROVISIONING_FAILED],
                timeout: CLUSTER_STATE_TIMEOUT,
            },
        )
        .await
        .context("waiting for reprovisioned cluster to become stable")?;
        Ok(())
    }

    /// Patch the node instance type and wait for stable. A no-op when the
    /// resize phase is disabled.
    pub async fn resize_cluster(&self) -> Result<()> {
        if !self.params.allow_resize {
            tracing::info!("cluster resize disabled, skipping");
            return Ok(());
        }

        let cluster_id = self.cluster_id();
        clusters::patch_cluster(
            &self.client,
            &cluster_id,
            &PatchClusterRequest {
                node_instance_type: Some(self.params.resize_instance_type.clone()),
            },
        )
        .await
        .with_context(|| format!("failed to request resize of cluster {cluster_id}"))?;

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Cluster,
                resource_id: &cluster_id,
                target_state: cluster_state::STABLE,
                failure_states: &[cluster_state::PROVISIONING_FAILED],
                timeout: CLUSTER_STATE_TIMEOUT,
            },
        )
        .await
        .context("waiting for resized cluster to become stable")?;
        Ok(())
    }

    /// Verify the outcome of the resize phase. The legacy provisioner
    /// patches instance types in place, so the patched value must stick;
    /// newer backends only guarantee the cluster settles back to stable.
    pub async fn check_cluster_resize(&self) -> Result<()> {
        if !self.params.allow_resize {
            return Ok(());
        }

        let cluster_id = self.cluster_id();
        let cluster = self.fetch_cluster(&cluster_id).await?;
        if cluster.provisioner == provisioner::LEGACY {
            if cluster.node_instance_type != self.params.resize_instance_type {
                bail!(
                    "cluster {cluster_id} node instance type is {:?}, expected {:?} after resize",
                    cluster.node_instance_type,
                    self.params.resize_instance_type
                );
            }
        } else if cluster.state != cluster_state::STABLE {
            bail!(
                "cluster {cluster_id} is {:?} after resize, expected stable",
                cluster.state
            );
        }
        Ok(())
    }

    /// Delete the cluster and wait for the deletion to finish.
    pub async fn delete_cluster(&self) -> Result<()> {
        let cluster_id = self.cluster_id();
        clusters::delete_cluster(&self.client, &cluster_id)
            .await
            .with_context(|| format!("failed to request deletion of cluster {cluster_id}"))?;

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Cluster,
                resource_id: &cluster_id,
                target_state: cluster_state::DELETED,
                failure_states: &[cluster_state::DELETION_FAILED],
                timeout: CLUSTER_STATE_TIMEOUT,
            },
        )
        .await
        .context("waiting for cluster deletion")?;
        Ok(())
    }

    /// Idempotent teardown: no-ops when the cluster is gone or already on
    /// its way out, so repeated harness runs against shared infrastructure
    /// do not collide. Polls instead of consuming the webhook channel.
    pub async fn cleanup(&self) -> Result<()> {
        let cluster_id = self.cluster_id();
        if cluster_id.is_empty() {
            return Ok(());
        }

        let Some(cluster) = clusters::get_cluster(&self.client, &cluster_id)
            .await
            .with_context(|| format!("failed to get cluster {cluster_id} for cleanup"))?
        else {
            return Ok(());
        };

        match cluster.state.as_str() {
            cluster_state::DELETED
            | cluster_state::DELETION_REQUESTED
            | cluster_state::DELETION_FAILED => return Ok(()),
            _ => {}
        }

        tracing::info!(cluster_id = %cluster_id, "cleaning up cluster");
        clusters::delete_cluster(&self.client, &cluster_id)
            .await
            .with_context(|| format!("failed to request deletion of cluster {cluster_id}"))?;

        let client = Arc::clone(&self.client);
        poll_until_state(
            &self.wait_config(CLUSTER_STATE_TIMEOUT),
            &format!("cluster {cluster_id}"),
            &[cluster_state::DELETED],
            &[cluster_state::DELETION_FAILED],
            || {
                let client = Arc::clone(&client);
                let cluster_id = cluster_id.clone();
                async move {
                    let cluster = clusters::get_cluster(&client, &cluster_id)
                        .await
                        .with_context(|| format!("failed to get cluster {cluster_id}"))?;
                    // A cluster that disappeared entirely counts as deleted.
                    Ok(cluster.map_or_else(|| cluster_state::DELETED.to_string(), |c| c.state))
                }
            },
        )
        .await?;
        Ok(())
    }

    // -- expected event sequences ------------------------------------------
    //
    // Providers read the recorded cluster ID, so they are only meaningful
    // after the creating step has run.

    pub fn creation_events(&self) -> Vec<EventOccurrence> {
        let id = self.cluster_id();
        vec![
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::NONE,
                cluster_state::CREATION_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::CREATION_REQUESTED,
                cluster_state::PROVISION_IN_PROGRESS,
            ),
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::PROVISION_IN_PROGRESS,
                cluster_state::STABLE,
            ),
        ]
    }

    pub fn provisioning_events(&self) -> Vec<EventOccurrence> {
        let id = self.cluster_id();
        vec![
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::STABLE,
                cluster_state::PROVISIONING_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::PROVISIONING_REQUESTED,
                cluster_state::STABLE,
            ),
        ]
    }

    pub fn resize_events(&self) -> Vec<EventOccurrence> {
        if !self.params.allow_resize {
            return Vec::new();
        }
        let id = self.cluster_id();
        vec![
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::STABLE,
                cluster_state::RESIZE_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::RESIZE_REQUESTED,
                cluster_state::STABLE,
            ),
        ]
    }

    pub fn deletion_events(&self) -> Vec<EventOccurrence> {
        let id = self.cluster_id();
        vec![
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::STABLE,
                cluster_state::DELETION_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Cluster,
                &id,
                cluster_state::DELETION_REQUESTED,
                cluster_state::DELETED,
            ),
        ]
    }
}

//! Installation lifecycle operations, health checks, and the bulk-export
//! data path used by the migration suite.

use std::io::BufRead;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::Rng;

use skiff_client::api::{cluster_installations, installations};
use skiff_client::models::{
    CreateInstallationRequest, ResourceType, cluster_installation_state, installation_state,
};
use skiff_client::Client;

use super::{
    DEFAULT_POLL_INTERVAL, DELETION_PENDING_TIMEOUT, DELETION_TIMEOUT, HIBERNATION_TIMEOUT,
    INSTALLATION_STATE_TIMEOUT, PING_TIMEOUT, STABLE_TIMEOUT, poll_transition, poll_until_state,
};
use crate::events::EventOccurrence;
use crate::kube::PodFileCopier;
use crate::wait::{WaitConfig, wait_until};
use crate::webhook::WebhookChannel;
use crate::webhook::waiter::{StateWaitRequest, wait_for_state};

/// CLI bundled in the application container.
const IN_POD_CLI: &str = "chatctl";
/// Where the in-pod export CLI writes its dump.
const EXPORT_REMOTE_PATH: &str = "/tmp/skiff-bulk-export.jsonl";
/// Label selector for the application pod inside the installation namespace.
const APP_POD_SELECTOR: &str = "app=chat-server";

/// Record counts from a bulk export, used to verify data preservation
/// across database migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub teams: u64,
    pub channels: u64,
    pub users: u64,
    pub posts: u64,
    pub direct_channels: u64,
    pub direct_posts: u64,
}

impl ExportStats {
    /// Count records in a newline-delimited JSON export. Lines with types
    /// outside the counted set are ignored.
    pub fn from_ndjson(reader: impl BufRead) -> Result<Self> {
        let mut stats = Self::default();
        for (number, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read export line {}", number + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: serde_json::Value = serde_json::from_str(&line)
                .with_context(|| format!("export line {} is not valid JSON", number + 1))?;
            match record.get("type").and_then(|t| t.as_str()) {
                Some("team") => stats.teams += 1,
                Some("channel") => stats.channels += 1,
                Some("user") => stats.users += 1,
                Some("post") => stats.posts += 1,
                Some("direct_channel") => stats.direct_channels += 1,
                Some("direct_post") => stats.direct_posts += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Immutable parameters an installation suite is constructed with.
#[derive(Debug, Clone)]
pub struct InstallationSuiteParams {
    pub owner_id: String,
    /// Subdomain new installations get their DNS under.
    pub dns_subdomain: String,
    pub database_type: String,
    pub filestore_type: String,
    pub size: String,
    /// Size used by the custom-size creation variant.
    pub custom_size: String,
    pub version: Option<String>,
    pub poll_interval: Duration,
    /// Test override for the health endpoint; `None` pings the
    /// installation's own DNS.
    pub ping_base_url: Option<String>,
}

impl Default for InstallationSuiteParams {
    fn default() -> Self {
        Self {
            owner_id: "skiff-e2e".to_string(),
            dns_subdomain: "test.cloud.example.com".to_string(),
            database_type: skiff_client::models::database_type::MULTI_TENANT_RDS.to_string(),
            filestore_type: skiff_client::models::filestore_type::MULTI_TENANT_S3.to_string(),
            size: "100users".to_string(),
            custom_size: "1000users".to_string(),
            version: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ping_base_url: None,
        }
    }
}

/// Per-creation overrides on top of the suite defaults.
#[derive(Debug, Clone, Default)]
struct InstallationOverrides {
    filestore: Option<String>,
    size: Option<String>,
}

/// Metadata accumulated as installation steps succeed. Each field is
/// written once by its recording step and read by later steps.
#[derive(Debug, Clone, Default)]
pub struct InstallationMeta {
    pub installation_id: String,
    pub cluster_installation_id: String,
    pub dns: String,
    pub connection_string: String,
    pub export_stats: Option<ExportStats>,
}

/// Installation operations for workflow steps.
pub struct InstallationSuite {
    client: Arc<Client>,
    webhooks: Arc<WebhookChannel>,
    copier: Arc<dyn PodFileCopier>,
    http: reqwest::Client,
    params: InstallationSuiteParams,
    meta: Mutex<InstallationMeta>,
}

impl InstallationSuite {
    pub fn new(
        client: Arc<Client>,
        webhooks: Arc<WebhookChannel>,
        copier: Arc<dyn PodFileCopier>,
        params: InstallationSuiteParams,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build health-check HTTP client")?;
        Ok(Self {
            client,
            webhooks,
            copier,
            http,
            params,
            meta: Mutex::new(InstallationMeta::default()),
        })
    }

    /// Target an existing installation instead of creating one.
    pub fn with_existing_installation(self, installation_id: impl Into<String>) -> Self {
        {
            let mut meta = self.meta.lock().expect("installation meta lock poisoned");
            meta.installation_id = installation_id.into();
        }
        self
    }

    pub fn installation_id(&self) -> String {
        self.meta().installation_id
    }

    pub fn cluster_installation_id(&self) -> String {
        self.meta().cluster_installation_id
    }

    pub fn connection_string(&self) -> String {
        self.meta().connection_string
    }

    pub fn export_stats(&self) -> Option<ExportStats> {
        self.meta().export_stats
    }

    fn meta(&self) -> InstallationMeta {
        self.meta.lock().expect("installation meta lock poisoned").clone()
    }

    fn wait_config(&self, timeout: Duration) -> WaitConfig {
        WaitConfig::new(timeout, self.params.poll_interval)
    }

    // -- creation ----------------------------------------------------------

    /// Create an installation with the suite defaults.
    pub async fn create_installation(&self) -> Result<()> {
        self.create_with(InstallationOverrides::default()).await
    }

    /// Creation variant on the versioned object-store filestore.
    pub async fn create_installation_versioned_filestore(&self) -> Result<()> {
        self.create_with(InstallationOverrides {
            filestore: Some(
                skiff_client::models::filestore_type::MULTI_TENANT_S3_VERSIONED.to_string(),
            ),
            ..Default::default()
        })
        .await
    }

    /// Creation variant with the custom provisioner size.
    pub async fn create_installation_custom_size(&self) -> Result<()> {
        self.create_with(InstallationOverrides {
            size: Some(self.params.custom_size.clone()),
            ..Default::default()
        })
        .await
    }

    async fn create_with(&self, overrides: InstallationOverrides) -> Result<()> {
        if self.installation_id().is_empty() {
            let dns = format!("e2e-test-{}.{}", random_dns_label(), self.params.dns_subdomain);
            let request = CreateInstallationRequest {
                owner_id: self.params.owner_id.clone(),
                dns,
                database: self.params.database_type.clone(),
                filestore: overrides
                    .filestore
                    .unwrap_or_else(|| self.params.filestore_type.clone()),
                size: overrides.size.unwrap_or_else(|| self.params.size.clone()),
                version: self.params.version.clone(),
            };
            let installation = installations::create_installation(&self.client, &request)
                .await
                .context("failed to request installation creation")?;
            tracing::info!(
                installation_id = %installation.id,
                dns = %installation.dns,
                "requested installation creation"
            );
            let mut meta = self.meta.lock().expect("installation meta lock poisoned");
            meta.installation_id = installation.id;
            meta.dns = installation.dns;
        }

        let installation_id = self.installation_id();
        let installation = installations::get_installation(&self.client, &installation_id)
            .await
            .with_context(|| format!("failed to get installation {installation_id}"))?
            .with_context(|| format!("installation {installation_id} not found"))?;
        if self.meta().dns.is_empty() {
            self.meta.lock().expect("installation meta lock poisoned").dns =
                installation.dns.clone();
        }

        match installation.state.as_str() {
            installation_state::STABLE => return self.wait_for_ping().await,
            installation_state::CREATION_FAILED => {
                bail!("installation {installation_id} is in terminal state {:?}", installation.state);
            }
            _ => {}
        }

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Installation,
                resource_id: &installation_id,
                target_state: installation_state::STABLE,
                failure_states: &[installation_state::CREATION_FAILED],
                timeout: INSTALLATION_STATE_TIMEOUT,
            },
        )
        .await
        .context("waiting for installation to become stable")?;

        self.wait_for_ping().await
    }

    // -- cluster installation ----------------------------------------------

    /// Record the cluster installation backing the installation.
    pub async fn get_cluster_installation(&self) -> Result<()> {
        let installation_id = self.installation_id();
        let cluster_installations =
            cluster_installations::list_cluster_installations(&self.client, &installation_id)
                .await
                .with_context(|| {
                    format!("failed to list cluster installations of {installation_id}")
                })?;

        let Some(first) = cluster_installations.into_iter().next() else {
            bail!("installation {installation_id} has no cluster installation");
        };
        tracing::info!(cluster_installation_id = %first.id, "recorded cluster installation");
        self.meta
            .lock()
            .expect("installation meta lock poisoned")
            .cluster_installation_id = first.id;
        Ok(())
    }

    /// Poll until the cluster installation reconciles to ready.
    pub async fn check_cluster_installation_status(&self) -> Result<()> {
        let cluster_installation_id = self.cluster_installation_id();
        let client = Arc::clone(&self.client);
        poll_until_state(
            &self.wait_config(STABLE_TIMEOUT),
            &format!("cluster installation {cluster_installation_id}"),
            &[cluster_installation_state::READY, cluster_installation_state::STABLE],
            &[cluster_installation_state::DELETED],
            || {
                let client = Arc::clone(&client);
                let id = cluster_installation_id.clone();
                async move {
                    let ci = cluster_installations::get_cluster_installation(&client, &id)
                        .await
                        .with_context(|| format!("failed to get cluster installation {id}"))?
                        .with_context(|| format!("cluster installation {id} not found"))?;
                    Ok(ci.state)
                }
            },
        )
        .await?;
        Ok(())
    }

    // -- in-pod CLI --------------------------------------------------------

    async fn exec(&self, command: &[&str]) -> Result<Vec<u8>> {
        let cluster_installation_id = self.cluster_installation_id();
        cluster_installations::exec_cli(&self.client, &cluster_installation_id, command)
            .await
            .with_context(|| {
                format!(
                    "failed to run {command:?} in cluster installation {cluster_installation_id}"
                )
            })
    }

    /// Seed teams, channels, and users through the in-pod CLI.
    pub async fn populate_sample_data(&self) -> Result<()> {
        self.exec(&[
            IN_POD_CLI,
            "sampledata",
            "--seed",
            "1",
            "--teams",
            "4",
            "--channels-per-team",
            "10",
            "--users",
            "30",
        ])
        .await
        .context("failed to populate sample data")?;
        Ok(())
    }

    /// Read the live database connection string through the in-pod config
    /// CLI.
    pub(crate) async fn fetch_connection_string(&self) -> Result<String> {
        let output = self
            .exec(&[IN_POD_CLI, "config", "get", "SqlSettings.DataSource"])
            .await
            .context("failed to read connection string")?;
        let connection_string = String::from_utf8_lossy(&output)
            .trim()
            .trim_matches('"')
            .to_string();
        if connection_string.is_empty() {
            bail!("connection string query returned empty output");
        }
        Ok(connection_string)
    }

    /// Trigger a bulk export in the pod, copy the dump out, and count its
    /// records.
    pub(crate) async fn collect_export_stats(&self) -> Result<ExportStats> {
        self.exec(&[IN_POD_CLI, "export", "create", "--path", EXPORT_REMOTE_PATH])
            .await
            .context("failed to trigger bulk export")?;

        let scratch = tempfile::tempdir().context("failed to create export scratch dir")?;
        let local_path = scratch.path().join("bulk-export.jsonl");
        let namespace = self.installation_id();
        self.copier
            .copy_from_pod(&namespace, APP_POD_SELECTOR, EXPORT_REMOTE_PATH, &local_path)
            .await
            .context("failed to copy bulk export out of pod")?;

        let file = std::fs::File::open(&local_path)
            .with_context(|| format!("failed to open {}", local_path.display()))?;
        ExportStats::from_ndjson(std::io::BufReader::new(file))
    }

    /// Record the connection string and bulk-export statistics in the suite
    /// metadata for later comparison.
    pub async fn get_connection_str_and_export(&self) -> Result<()> {
        let connection_string = self.fetch_connection_string().await?;
        let stats = self.collect_export_stats().await?;
        tracing::info!(?stats, "recorded bulk-export statistics");

        let mut meta = self.meta.lock().expect("installation meta lock poisoned");
        meta.connection_string = connection_string;
        meta.export_stats = Some(stats);
        Ok(())
    }

    // -- hibernation -------------------------------------------------------

    /// Hibernate the installation, rejecting unexpected intermediate
    /// states.
    pub async fn hibernate_installation(&self) -> Result<()> {
        let installation_id = self.installation_id();
        installations::hibernate_installation(&self.client, &installation_id)
            .await
            .with_context(|| format!("failed to request hibernation of {installation_id}"))?;

        let client = Arc::clone(&self.client);
        poll_transition(
            &self.wait_config(HIBERNATION_TIMEOUT),
            &format!("installation {installation_id}"),
            installation_state::HIBERNATING,
            &[installation_state::STABLE, installation_state::HIBERNATION_REQUESTED],
            || {
                let client = Arc::clone(&client);
                let id = installation_id.clone();
                async move {
                    let installation = installations::get_installation(&client, &id)
                        .await
                        .with_context(|| format!("failed to get installation {id}"))?
                        .with_context(|| format!("installation {id} not found"))?;
                    Ok(installation.state)
                }
            },
        )
        .await
    }

    /// Wake the installation back up and wait for it to serve traffic.
    pub async fn wake_up_installation(&self) -> Result<()> {
        let installation_id = self.installation_id();
        installations::wake_up_installation(&self.client, &installation_id)
            .await
            .with_context(|| format!("failed to request wake-up of {installation_id}"))?;

        let client = Arc::clone(&self.client);
        poll_transition(
            &self.wait_config(INSTALLATION_STATE_TIMEOUT),
            &format!("installation {installation_id}"),
            installation_state::STABLE,
            &[
                installation_state::HIBERNATING,
                installation_state::WAKE_UP_REQUESTED,
                installation_state::UPDATE_IN_PROGRESS,
            ],
            || {
                let client = Arc::clone(&client);
                let id = installation_id.clone();
                async move {
                    let installation = installations::get_installation(&client, &id)
                        .await
                        .with_context(|| format!("failed to get installation {id}"))?
                        .with_context(|| format!("installation {id} not found"))?;
                    Ok(installation.state)
                }
            },
        )
        .await?;

        self.wait_for_ping().await
    }

    // -- health ------------------------------------------------------------

    fn ping_url(&self) -> String {
        let meta = self.meta();
        match &self.params.ping_base_url {
            Some(base) => format!("{}/api/v4/system/ping", base.trim_end_matches('/')),
            None => format!("https://{}/api/v4/system/ping", meta.dns),
        }
    }

    async fn ping(&self) -> Result<()> {
        let url = self.ping_url();
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("ping request to {url} failed"))?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("ping to {url} answered {}", response.status());
        }
        Ok(())
    }

    /// Poll the health endpoint until it answers 200. Request failures are
    /// expected while DNS and ingress converge, so they count as not-ready
    /// rather than against the error budget.
    async fn wait_for_ping(&self) -> Result<()> {
        let config = self.wait_config(PING_TIMEOUT);
        wait_until(&config, || {
            let ping = self.ping();
            async move {
                match ping.await {
                    Ok(()) => Ok(Some(())),
                    Err(err) => {
                        tracing::debug!(error = %format!("{err:#}"), "installation not serving yet");
                        Ok(None)
                    }
                }
            }
        })
        .await
        .context("waiting for installation health endpoint")?;
        Ok(())
    }

    /// One-shot health check; any non-200 answer is a failure.
    pub async fn check_health(&self) -> Result<()> {
        self.ping().await
    }

    // -- deletion ----------------------------------------------------------

    /// Delete the installation: park it in deletion-pending, shorten the
    /// expiry so the hold does not stall the test, and wait for the final
    /// deletion.
    pub async fn delete_installation(&self) -> Result<()> {
        let installation_id = self.installation_id();
        installations::delete_installation(&self.client, &installation_id)
            .await
            .with_context(|| format!("failed to request deletion of {installation_id}"))?;

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Installation,
                resource_id: &installation_id,
                target_state: installation_state::DELETION_PENDING,
                failure_states: &[installation_state::DELETION_FAILED],
                timeout: DELETION_PENDING_TIMEOUT,
            },
        )
        .await
        .context("waiting for installation to reach deletion-pending")?;

        self.expedite_deletion(&installation_id).await?;

        wait_for_state(
            &self.webhooks,
            &StateWaitRequest {
                resource_type: ResourceType::Installation,
                resource_id: &installation_id,
                target_state: installation_state::DELETED,
                failure_states: &[installation_state::DELETION_FAILED],
                timeout: DELETION_TIMEOUT,
            },
        )
        .await
        .context("waiting for installation deletion")?;
        Ok(())
    }

    /// Move the deletion-pending expiry to one second from now.
    async fn expedite_deletion(&self, installation_id: &str) -> Result<()> {
        let expiry = chrono::Utc::now().timestamp_millis() + 1_000;
        installations::update_deletion_pending_expiry(&self.client, installation_id, expiry)
            .await
            .with_context(|| {
                format!("failed to shorten deletion-pending expiry of {installation_id}")
            })?;
        Ok(())
    }

    /// Idempotent teardown mirroring [`Self::delete_installation`] but
    /// driven by polling, so it works regardless of webhook sink state and
    /// no-ops on anything already gone.
    pub async fn cleanup(&self) -> Result<()> {
        let installation_id = self.installation_id();
        if installation_id.is_empty() {
            return Ok(());
        }

        let Some(installation) = installations::get_installation(&self.client, &installation_id)
            .await
            .with_context(|| format!("failed to get installation {installation_id} for cleanup"))?
        else {
            return Ok(());
        };

        match installation.state.as_str() {
            installation_state::DELETED => return Ok(()),
            installation_state::DELETION_PENDING_REQUESTED
            | installation_state::DELETION_PENDING_IN_PROGRESS
            | installation_state::DELETION_PENDING
            | installation_state::DELETION_REQUESTED
            | installation_state::DELETION_IN_PROGRESS => {}
            _ => {
                tracing::info!(installation_id = %installation_id, "cleaning up installation");
                installations::delete_installation(&self.client, &installation_id)
                    .await
                    .with_context(|| format!("failed to request deletion of {installation_id}"))?;
            }
        }

        let client = Arc::clone(&self.client);
        let fetch_state = || {
            let client = Arc::clone(&client);
            let id = installation_id.clone();
            async move {
                let installation = installations::get_installation(&client, &id)
                    .await
                    .with_context(|| format!("failed to get installation {id}"))?;
                // Missing entirely counts as deleted.
                Ok(installation.map_or_else(|| installation_state::DELETED.to_string(), |i| i.state))
            }
        };

        poll_until_state(
            &self.wait_config(DELETION_PENDING_TIMEOUT),
            &format!("installation {installation_id}"),
            &[installation_state::DELETION_PENDING, installation_state::DELETED],
            &[installation_state::DELETION_FAILED],
            fetch_state.clone(),
        )
        .await?;

        self.expedite_deletion(&installation_id).await?;

        poll_until_state(
            &self.wait_config(DELETION_TIMEOUT),
            &format!("installation {installation_id}"),
            &[installation_state::DELETED],
            &[installation_state::DELETION_FAILED],
            fetch_state,
        )
        .await?;
        Ok(())
    }

    // -- expected event sequences ------------------------------------------

    pub fn creation_events(&self) -> Vec<EventOccurrence> {
        let id = self.installation_id();
        vec![
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::NONE,
                installation_state::CREATION_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::CREATION_REQUESTED,
                installation_state::CREATION_IN_PROGRESS,
            ),
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::CREATION_IN_PROGRESS,
                installation_state::STABLE,
            ),
        ]
    }

    pub fn hibernation_events(&self) -> Vec<EventOccurrence> {
        let id = self.installation_id();
        vec![
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::STABLE,
                installation_state::HIBERNATION_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::HIBERNATION_REQUESTED,
                installation_state::HIBERNATING,
            ),
        ]
    }

    pub fn wake_up_events(&self) -> Vec<EventOccurrence> {
        let id = self.installation_id();
        vec![
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::HIBERNATING,
                installation_state::WAKE_UP_REQUESTED,
            ),
            EventOccurrence::new(
                ResourceType::Installation,
                &id,
                installation_state::WAKE_UP_REQUESTED,
                installation_state::STABLE,
            ),
        ]
    }

    pub fn deletion_events(&self) -> Vec<EventOccurrence> {
        let id = self.installation_id();
        let chain = [
            installation_state::STABLE,
            installation_state::DELETION_PENDING_REQUESTED,
            installation_state::DELETION_PENDING_IN_PROGRESS,
            installation_state::DELETION_PENDING,
            installation_state::DELETION_REQUESTED,
            installation_state::DELETION_IN_PROGRESS,
            installation_state::DELETED,
        ];
        chain
            .windows(2)
            .map(|pair| EventOccurrence::new(ResourceType::Installation, &id, pair[0], pair[1]))
            .collect()
    }
}

/// Four random lowercase letters for the test DNS convention
/// `e2e-test-{random}.{subdomain}`.
fn random_dns_label() -> String {
    let mut rng = rand::rng();
    (0..4).map(|_| rng.random_range('a'..='z')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_stats_count_by_type() {
        let dump = concat!(
            r#"{"type":"team","name":"eng"}"#, "\n",
            r#"{"type":"channel","name":"general"}"#, "\n",
            r#"{"type":"channel","name":"random"}"#, "\n",
            r#"{"type":"user","username":"alice"}"#, "\n",
            r#"{"type":"post","message":"hi"}"#, "\n",
            r#"{"type":"direct_channel","members":["a","b"]}"#, "\n",
            r#"{"type":"direct_post","message":"psst"}"#, "\n",
            r#"{"type":"emoji","name":"party"}"#, "\n",
            "\n",
        );
        let stats = ExportStats::from_ndjson(dump.as_bytes()).unwrap();
        assert_eq!(
            stats,
            ExportStats {
                teams: 1,
                channels: 2,
                users: 1,
                posts: 1,
                direct_channels: 1,
                direct_posts: 1,
            }
        );
    }

    #[test]
    fn export_stats_reject_malformed_lines() {
        let dump = "{\"type\":\"team\"}\nnot-json\n";
        assert!(ExportStats::from_ndjson(dump.as_bytes()).is_err());
    }

    #[test]
    fn dns_labels_are_four_lowercase_letters() {
        for _ in 0..32 {
            let label = random_dns_label();
            assert_eq!(label.len(), 4);
            assert!(label.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn deletion_events_walk_the_full_chain() {
        // Providers only need metadata, not a live client, so build the
        // chain directly.
        let chain = [
            installation_state::STABLE,
            installation_state::DELETION_PENDING_REQUESTED,
            installation_state::DELETION_PENDING_IN_PROGRESS,
            installation_state::DELETION_PENDING,
            installation_state::DELETION_REQUESTED,
            installation_state::DELETION_IN_PROGRESS,
            installation_state::DELETED,
        ];
        assert_eq!(chain.windows(2).count(), 6);
    }
}

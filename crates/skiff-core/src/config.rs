use std::env;

use anyhow::{Context, Result, bail};

/// Harness configuration.
///
/// Everything is resolved from the environment at startup; there is no
/// config file. Only the provisioner URL is required.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Base URL of the provisioning API. `SKIFF_PROVISIONER_URL`, required.
    pub provisioner_url: String,
    /// Bind/delivery URL for the event recorder.
    /// `SKIFF_EVENT_LISTENER_ADDRESS`, default `http://localhost:11112`.
    pub event_listen_url: String,
    /// Bind/delivery URL for the webhook sink.
    /// `SKIFF_WEBHOOK_ADDRESS`, default `http://localhost:11111`.
    pub webhook_listen_url: String,
    /// DNS subdomain test installations are created under.
    /// `SKIFF_DNS_SUBDOMAIN`, default `test.cloud.example.com`.
    pub dns_subdomain: String,
    /// Database backend for new installations.
    /// `SKIFF_INSTALLATION_DB_TYPE`, default multitenant RDS.
    pub database_type: String,
    /// Filestore backend for new installations.
    /// `SKIFF_INSTALLATION_FILESTORE_TYPE`, default multitenant S3.
    pub filestore_type: String,
    /// AMI for new clusters. `SKIFF_AMI`, optional.
    pub ami: Option<String>,
    /// VPC for new clusters. `SKIFF_VPC`, optional.
    pub vpc: Option<String>,
    /// Role ARN handed to the managed provisioner.
    /// `SKIFF_PROVISIONER_ROLE_ARN`, optional.
    pub provisioner_role_arn: Option<String>,
    /// Whether the cluster resize phase runs. `SKIFF_RESIZE`, default false.
    pub allow_resize: bool,
    /// Whether suites clean their resources up after verification.
    /// `SKIFF_CLEANUP`, default true.
    pub cleanup: bool,
    /// Verbose logging. `SKIFF_DEBUG`, default false.
    pub debug: bool,
    /// Resume against an existing cluster instead of creating one.
    /// `SKIFF_CLUSTER_ID`, optional.
    pub existing_cluster_id: Option<String>,
    /// Resume against an existing installation. `SKIFF_INSTALLATION_ID`,
    /// optional.
    pub existing_installation_id: Option<String>,
    /// Destination multitenant database for the DB-migration workflow.
    /// `SKIFF_DESTINATION_DB`, required only by that workflow.
    pub destination_db_id: Option<String>,
    /// Result notification target. `WEBHOOK_URL`, optional.
    pub notification_url: Option<String>,
}

impl HarnessConfig {
    pub const DEFAULT_EVENT_LISTENER_ADDRESS: &str = "http://localhost:11112";
    pub const DEFAULT_WEBHOOK_ADDRESS: &str = "http://localhost:11111";
    pub const DEFAULT_DNS_SUBDOMAIN: &str = "test.cloud.example.com";

    /// Build a config from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            provisioner_url: env::var("SKIFF_PROVISIONER_URL")
                .context("SKIFF_PROVISIONER_URL must be set")?,
            event_listen_url: env_or(
                "SKIFF_EVENT_LISTENER_ADDRESS",
                Self::DEFAULT_EVENT_LISTENER_ADDRESS,
            ),
            webhook_listen_url: env_or("SKIFF_WEBHOOK_ADDRESS", Self::DEFAULT_WEBHOOK_ADDRESS),
            dns_subdomain: env_or("SKIFF_DNS_SUBDOMAIN", Self::DEFAULT_DNS_SUBDOMAIN),
            database_type: env_or(
                "SKIFF_INSTALLATION_DB_TYPE",
                skiff_client::models::database_type::MULTI_TENANT_RDS,
            ),
            filestore_type: env_or(
                "SKIFF_INSTALLATION_FILESTORE_TYPE",
                skiff_client::models::filestore_type::MULTI_TENANT_S3,
            ),
            ami: env_opt("SKIFF_AMI"),
            vpc: env_opt("SKIFF_VPC"),
            provisioner_role_arn: env_opt("SKIFF_PROVISIONER_ROLE_ARN"),
            allow_resize: env_bool("SKIFF_RESIZE", false)?,
            cleanup: env_bool("SKIFF_CLEANUP", true)?,
            debug: env_bool("SKIFF_DEBUG", false)?,
            existing_cluster_id: env_opt("SKIFF_CLUSTER_ID"),
            existing_installation_id: env_opt("SKIFF_INSTALLATION_ID"),
            destination_db_id: env_opt("SKIFF_DESTINATION_DB"),
            notification_url: env_opt("WEBHOOK_URL"),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("{name} must be a boolean, got {other:?}"),
        },
    }
}

//! In-memory resource stores and state-machine advancement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiff_client::models::{
    Cluster, ClusterInstallation, Installation, InstallationDbMigrationOperation,
    MultitenantDatabase, ResourceType, StateChangeEventPayload, Subscription, Webhook,
    WebhookPayload, migration_state,
};

use crate::{DESTINATION_DB_ID, SOURCE_DB_ID};

/// Knobs for the mock's timing.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Pause between state-machine hops.
    pub transition_delay: Duration,
    /// How long one webhook/event delivery may block before the mock gives
    /// up on it, like the real publisher does.
    pub delivery_timeout: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            transition_delay: Duration::from_millis(25),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct MockState {
    pub(crate) opts: MockOptions,
    http: reqwest::Client,
    counter: AtomicU64,
    pub(crate) clusters: Mutex<HashMap<String, Cluster>>,
    pub(crate) installations: Mutex<HashMap<String, Installation>>,
    pub(crate) cluster_installations: Mutex<HashMap<String, ClusterInstallation>>,
    pub(crate) subscriptions: Mutex<Vec<Subscription>>,
    pub(crate) webhooks: Mutex<Vec<Webhook>>,
    pub(crate) databases: Mutex<Vec<MultitenantDatabase>>,
    pub(crate) migrations: Mutex<HashMap<String, InstallationDbMigrationOperation>>,
    /// Live database connection string per installation, served through the
    /// in-pod config CLI.
    pub(crate) connection_strings: Mutex<HashMap<String, String>>,
}

impl MockState {
    pub(crate) fn new(opts: MockOptions) -> Self {
        let databases = vec![
            MultitenantDatabase {
                id: SOURCE_DB_ID.to_string(),
                database_type: "postgres".to_string(),
                installation_ids: Vec::new(),
            },
            MultitenantDatabase {
                id: DESTINATION_DB_ID.to_string(),
                database_type: "postgres".to_string(),
                installation_ids: Vec::new(),
            },
        ];
        Self {
            opts,
            http: reqwest::Client::new(),
            counter: AtomicU64::new(1),
            clusters: Mutex::new(HashMap::new()),
            installations: Mutex::new(HashMap::new()),
            cluster_installations: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            webhooks: Mutex::new(Vec::new()),
            databases: Mutex::new(databases),
            migrations: Mutex::new(HashMap::new()),
            connection_strings: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{:08}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Connection string an installation gets on a given database cluster.
    /// Deterministic so a rollback restores the original exactly.
    pub(crate) fn connection_string_for(database_id: &str, installation_id: &str) -> String {
        format!("postgres://app:secret@{database_id}.cluster.local:5432/cloud_{installation_id}")
    }

    /// Deliver one transition to every subscription and webhook.
    async fn emit(&self, resource_type: ResourceType, id: &str, old: &str, new: &str) {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let subscriptions = self.subscriptions.lock().expect("subscriptions lock").clone();
        let webhooks = self.webhooks.lock().expect("webhooks lock").clone();

        let event = StateChangeEventPayload {
            event_id: self.next_id("event-"),
            resource_type,
            resource_id: id.to_string(),
            old_state: old.to_string(),
            new_state: new.to_string(),
            timestamp,
            extra: serde_json::Map::new(),
        };
        for subscription in subscriptions {
            let result = self
                .http
                .post(&subscription.url)
                .timeout(self.opts.delivery_timeout)
                .json(&event)
                .send()
                .await;
            if let Err(err) = result {
                tracing::debug!(url = %subscription.url, error = %err, "event delivery failed");
            }
        }

        let payload = WebhookPayload {
            resource_type,
            id: id.to_string(),
            old_state: old.to_string(),
            new_state: new.to_string(),
            timestamp,
            extra: serde_json::Map::new(),
        };
        for webhook in webhooks {
            let result = self
                .http
                .post(&webhook.url)
                .timeout(self.opts.delivery_timeout)
                .json(&payload)
                .send()
                .await;
            if let Err(err) = result {
                tracing::debug!(url = %webhook.url, error = %err, "webhook delivery failed");
            }
        }
    }

    fn swap_cluster_state(&self, id: &str, new: &str) -> Option<String> {
        let mut clusters = self.clusters.lock().expect("clusters lock");
        let cluster = clusters.get_mut(id)?;
        let old = std::mem::replace(&mut cluster.state, new.to_string());
        Some(old)
    }

    fn swap_installation_state(&self, id: &str, new: &str) -> Option<String> {
        let mut installations = self.installations.lock().expect("installations lock");
        let installation = installations.get_mut(id)?;
        let old = std::mem::replace(&mut installation.state, new.to_string());
        Some(old)
    }

    fn swap_cluster_installation_state(&self, id: &str, new: &str) -> Option<String> {
        let mut cluster_installations =
            self.cluster_installations.lock().expect("cluster installations lock");
        let ci = cluster_installations.get_mut(id)?;
        let old = std::mem::replace(&mut ci.state, new.to_string());
        Some(old)
    }

    /// Walk a resource through `states`, one hop per transition delay,
    /// emitting each transition. Stops if the resource disappears.
    pub(crate) fn advance(
        this: &Arc<Self>,
        resource_type: ResourceType,
        id: String,
        states: Vec<&'static str>,
    ) {
        let state = Arc::clone(this);
        tokio::spawn(async move {
            for new in states {
                tokio::time::sleep(state.opts.transition_delay).await;
                let old = match resource_type {
                    ResourceType::Cluster => state.swap_cluster_state(&id, new),
                    ResourceType::Installation => state.swap_installation_state(&id, new),
                    ResourceType::ClusterInstallation => {
                        state.swap_cluster_installation_state(&id, new)
                    }
                };
                let Some(old) = old else { return };
                state.emit(resource_type, &id, &old, new).await;
            }
        });
    }

    /// Move an installation between multitenant databases and rewrite its
    /// connection string.
    pub(crate) fn place_installation_on(&self, installation_id: &str, database_id: &str) {
        let mut databases = self.databases.lock().expect("databases lock");
        for database in databases.iter_mut() {
            database.installation_ids.retain(|id| id != installation_id);
            if database.id == database_id {
                database.installation_ids.push(installation_id.to_string());
            }
        }
        drop(databases);

        self.connection_strings.lock().expect("connection strings lock").insert(
            installation_id.to_string(),
            Self::connection_string_for(database_id, installation_id),
        );
    }

    /// Drive a freshly requested migration to `Succeeded`, switching the
    /// installation to the destination database on completion.
    pub(crate) fn run_migration(this: &Arc<Self>, operation_id: String) {
        let state = Arc::clone(this);
        tokio::spawn(async move {
            for next in [migration_state::IN_PROGRESS, migration_state::SUCCEEDED] {
                tokio::time::sleep(state.opts.transition_delay).await;
                let Some((installation_id, destination)) = state.with_migration(&operation_id, next)
                else {
                    return;
                };
                if next == migration_state::SUCCEEDED {
                    state.place_installation_on(&installation_id, &destination);
                }
            }
        });
    }

    /// Finish a requested rollback, putting the installation back on its
    /// source database.
    pub(crate) fn run_rollback(this: &Arc<Self>, operation_id: String) {
        let state = Arc::clone(this);
        tokio::spawn(async move {
            tokio::time::sleep(state.opts.transition_delay).await;
            let source = {
                let migrations = state.migrations.lock().expect("migrations lock");
                migrations
                    .get(&operation_id)
                    .map(|op| (op.installation_id.clone(), op.source_database_id.clone()))
            };
            let Some((installation_id, source_db)) = source else { return };
            state.place_installation_on(&installation_id, &source_db);
            state.with_migration(&operation_id, migration_state::ROLLBACK_FINISHED);
        });
    }

    /// Update a migration operation's state, returning its installation and
    /// destination database.
    fn with_migration(&self, operation_id: &str, new_state: &str) -> Option<(String, String)> {
        let mut migrations = self.migrations.lock().expect("migrations lock");
        let operation = migrations.get_mut(operation_id)?;
        operation.state = new_state.to_string();
        Some((
            operation.installation_id.clone(),
            operation.destination_database_id.clone(),
        ))
    }
}

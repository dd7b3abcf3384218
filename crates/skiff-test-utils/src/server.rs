//! Axum front-end of the mock provisioning API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skiff_client::models::{
    Cluster, ClusterInstallation, CreateClusterRequest, CreateInstallationRequest,
    CreateSubscriptionRequest, CreateWebhookRequest, ExecRequest, Installation,
    InstallationDbMigrationOperation, MigrateDatabaseRequest, MultitenantDatabase,
    PatchClusterRequest, PatchDeletionPendingExpiryRequest, ResourceType, Subscription, Webhook,
    cluster_installation_state, cluster_state, installation_state, migration_state,
};

use crate::state::{MockOptions, MockState};

/// In-process mock of the provisioning control plane.
pub struct MockProvisioner {
    state: Arc<MockState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

impl MockProvisioner {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(MockOptions::default()).await
    }

    pub async fn spawn_with(opts: MockOptions) -> Result<Self> {
        let state = Arc::new(MockState::new(opts));
        let router = router(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock provisioner")?;
        let addr = listener.local_addr().context("failed to read mock address")?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "mock provisioner exited with error");
            }
        });

        Ok(Self {
            state,
            shutdown,
            task,
            addr,
        })
    }

    /// Base URL for a [`skiff_client::Client`].
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }

    // -- test introspection ------------------------------------------------

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.lock().expect("subscriptions lock").len()
    }

    pub fn webhook_count(&self) -> usize {
        self.state.webhooks.lock().expect("webhooks lock").len()
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.state.clusters.lock().expect("clusters lock").get(cluster_id).cloned()
    }

    pub fn installation(&self, installation_id: &str) -> Option<Installation> {
        self.state
            .installations
            .lock()
            .expect("installations lock")
            .get(installation_id)
            .cloned()
    }

    pub fn connection_string(&self, installation_id: &str) -> Option<String> {
        self.state
            .connection_strings
            .lock()
            .expect("connection strings lock")
            .get(installation_id)
            .cloned()
    }

    pub fn database(&self, database_id: &str) -> Option<MultitenantDatabase> {
        self.state
            .databases
            .lock()
            .expect("databases lock")
            .iter()
            .find(|db| db.id == database_id)
            .cloned()
    }
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/api/clusters", post(create_cluster).get(list_clusters))
        .route("/api/cluster/{id}", get(get_cluster).patch(patch_cluster).delete(delete_cluster))
        .route("/api/cluster/{id}/provision", post(provision_cluster))
        .route("/api/installations", post(create_installation).get(list_installations))
        .route("/api/installation/{id}", get(get_installation).delete(delete_installation))
        .route("/api/installation/{id}/hibernate", post(hibernate_installation))
        .route("/api/installation/{id}/wakeup", post(wake_up_installation))
        .route(
            "/api/installation/{id}/deletion-pending-expiry",
            patch(update_deletion_pending_expiry),
        )
        .route("/api/cluster_installations", get(list_cluster_installations))
        .route("/api/cluster_installation/{id}", get(get_cluster_installation))
        .route("/api/cluster_installation/{id}/exec", post(exec_cli))
        .route("/api/subscriptions", post(create_subscription).get(list_subscriptions))
        .route("/api/subscription/{id}", delete(delete_subscription))
        .route("/api/webhooks", post(create_webhook).get(list_webhooks))
        .route("/api/webhook/{id}", delete(delete_webhook))
        .route("/api/databases", get(list_databases))
        .route("/api/migrations", post(migrate_database))
        .route("/api/migration/{id}", get(get_migration))
        .route("/api/migration/{id}/commit", post(commit_migration))
        .route("/api/migration/{id}/rollback", post(rollback_migration))
        .route("/api/v4/system/ping", get(ping))
        .with_state(state)
}

async fn ping() -> &'static str {
    "OK"
}

// -- clusters ---------------------------------------------------------------

async fn create_cluster(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CreateClusterRequest>,
) -> Json<Cluster> {
    let cluster = Cluster {
        id: state.next_id("cluster-"),
        state: cluster_state::NONE.to_string(),
        provisioner: request.provisioner,
        node_instance_type: request.node_instance_type,
        allow_installations: request.allow_installations,
    };
    state
        .clusters
        .lock()
        .expect("clusters lock")
        .insert(cluster.id.clone(), cluster.clone());

    MockState::advance(
        &state,
        ResourceType::Cluster,
        cluster.id.clone(),
        vec![
            cluster_state::CREATION_REQUESTED,
            cluster_state::PROVISION_IN_PROGRESS,
            cluster_state::STABLE,
        ],
    );
    Json(cluster)
}

async fn list_clusters(State(state): State<Arc<MockState>>) -> Json<Vec<Cluster>> {
    Json(state.clusters.lock().expect("clusters lock").values().cloned().collect())
}

async fn get_cluster(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.clusters.lock().expect("clusters lock").get(&id) {
        Some(cluster) => Json(cluster.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn provision_cluster(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if !state.clusters.lock().expect("clusters lock").contains_key(&id) {
        return StatusCode::NOT_FOUND;
    }
    MockState::advance(
        &state,
        ResourceType::Cluster,
        id,
        vec![cluster_state::PROVISIONING_REQUESTED, cluster_state::STABLE],
    );
    StatusCode::OK
}

async fn patch_cluster(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(request): Json<PatchClusterRequest>,
) -> impl IntoResponse {
    let updated = {
        let mut clusters = state.clusters.lock().expect("clusters lock");
        let Some(cluster) = clusters.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if let Some(node_instance_type) = request.node_instance_type {
            cluster.node_instance_type = node_instance_type;
        }
        cluster.clone()
    };
    MockState::advance(
        &state,
        ResourceType::Cluster,
        id,
        vec![cluster_state::RESIZE_REQUESTED, cluster_state::STABLE],
    );
    Json(updated).into_response()
}

async fn delete_cluster(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> StatusCode {
    if !state.clusters.lock().expect("clusters lock").contains_key(&id) {
        return StatusCode::NOT_FOUND;
    }
    MockState::advance(
        &state,
        ResourceType::Cluster,
        id,
        vec![cluster_state::DELETION_REQUESTED, cluster_state::DELETED],
    );
    StatusCode::OK
}

// -- installations ----------------------------------------------------------

async fn create_installation(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CreateInstallationRequest>,
) -> Json<Installation> {
    let installation = Installation {
        id: state.next_id("installation-"),
        state: installation_state::NONE.to_string(),
        dns: request.dns,
        owner_id: request.owner_id,
        database: request.database,
        filestore: request.filestore,
        size: request.size,
        version: request.version.unwrap_or_default(),
        deletion_pending_expiry: 0,
    };
    state
        .installations
        .lock()
        .expect("installations lock")
        .insert(installation.id.clone(), installation.clone());
    state.place_installation_on(&installation.id, crate::SOURCE_DB_ID);

    // Bind the installation to some cluster, like the scheduler would.
    let cluster_id = state
        .clusters
        .lock()
        .expect("clusters lock")
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "cluster-unassigned".to_string());
    let ci = ClusterInstallation {
        id: state.next_id("ci-"),
        cluster_id,
        installation_id: installation.id.clone(),
        state: cluster_installation_state::NONE.to_string(),
    };
    state
        .cluster_installations
        .lock()
        .expect("cluster installations lock")
        .insert(ci.id.clone(), ci.clone());

    MockState::advance(
        &state,
        ResourceType::Installation,
        installation.id.clone(),
        vec![
            installation_state::CREATION_REQUESTED,
            installation_state::CREATION_IN_PROGRESS,
            installation_state::STABLE,
        ],
    );
    MockState::advance(
        &state,
        ResourceType::ClusterInstallation,
        ci.id,
        vec![
            cluster_installation_state::CREATION_REQUESTED,
            cluster_installation_state::RECONCILING,
            cluster_installation_state::STABLE,
        ],
    );
    Json(installation)
}

async fn list_installations(State(state): State<Arc<MockState>>) -> Json<Vec<Installation>> {
    Json(state.installations.lock().expect("installations lock").values().cloned().collect())
}

async fn get_installation(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.installations.lock().expect("installations lock").get(&id) {
        Some(installation) => Json(installation.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_installation(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if !state.installations.lock().expect("installations lock").contains_key(&id) {
        return StatusCode::NOT_FOUND;
    }
    // Deletion parks in deletion-pending until the expiry is updated.
    MockState::advance(
        &state,
        ResourceType::Installation,
        id,
        vec![
            installation_state::DELETION_PENDING_REQUESTED,
            installation_state::DELETION_PENDING_IN_PROGRESS,
            installation_state::DELETION_PENDING,
        ],
    );
    StatusCode::OK
}

async fn hibernate_installation(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if !state.installations.lock().expect("installations lock").contains_key(&id) {
        return StatusCode::NOT_FOUND;
    }
    MockState::advance(
        &state,
        ResourceType::Installation,
        id,
        vec![
            installation_state::HIBERNATION_REQUESTED,
            installation_state::HIBERNATING,
        ],
    );
    StatusCode::OK
}

async fn wake_up_installation(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if !state.installations.lock().expect("installations lock").contains_key(&id) {
        return StatusCode::NOT_FOUND;
    }
    MockState::advance(
        &state,
        ResourceType::Installation,
        id,
        vec![installation_state::WAKE_UP_REQUESTED, installation_state::STABLE],
    );
    StatusCode::OK
}

async fn update_deletion_pending_expiry(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(request): Json<PatchDeletionPendingExpiryRequest>,
) -> impl IntoResponse {
    let updated = {
        let mut installations = state.installations.lock().expect("installations lock");
        let Some(installation) = installations.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        installation.deletion_pending_expiry = request.deletion_pending_expiry;
        installation.clone()
    };
    // An imminent expiry releases the parked deletion.
    MockState::advance(
        &state,
        ResourceType::Installation,
        id,
        vec![
            installation_state::DELETION_REQUESTED,
            installation_state::DELETION_IN_PROGRESS,
            installation_state::DELETED,
        ],
    );
    Json(updated).into_response()
}

// -- cluster installations --------------------------------------------------

#[derive(Debug, Deserialize)]
struct InstallationQuery {
    installation: Option<String>,
}

async fn list_cluster_installations(
    State(state): State<Arc<MockState>>,
    Query(query): Query<InstallationQuery>,
) -> Json<Vec<ClusterInstallation>> {
    let cluster_installations = state
        .cluster_installations
        .lock()
        .expect("cluster installations lock")
        .values()
        .filter(|ci| {
            query
                .installation
                .as_ref()
                .is_none_or(|id| ci.installation_id == *id)
        })
        .cloned()
        .collect();
    Json(cluster_installations)
}

async fn get_cluster_installation(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state
        .cluster_installations
        .lock()
        .expect("cluster installations lock")
        .get(&id)
    {
        Some(ci) => Json(ci.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn exec_cli(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> impl IntoResponse {
    let installation_id = match state
        .cluster_installations
        .lock()
        .expect("cluster installations lock")
        .get(&id)
    {
        Some(ci) => ci.installation_id.clone(),
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    match request.command.get(1).map(String::as_str) {
        Some("config") => {
            let connection_string = state
                .connection_strings
                .lock()
                .expect("connection strings lock")
                .get(&installation_id)
                .cloned()
                .unwrap_or_default();
            format!("{connection_string}\n").into_response()
        }
        Some("export") => "export scheduled\n".into_response(),
        Some("sampledata") => "sample data seeded\n".into_response(),
        _ => "ok\n".into_response(),
    }
}

// -- subscriptions and webhooks ---------------------------------------------

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner: Option<String>,
}

async fn create_subscription(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Json<Subscription> {
    let subscription = Subscription {
        id: state.next_id("subscription-"),
        owner_id: request.owner_id,
        url: request.url,
    };
    state
        .subscriptions
        .lock()
        .expect("subscriptions lock")
        .push(subscription.clone());
    Json(subscription)
}

async fn list_subscriptions(
    State(state): State<Arc<MockState>>,
    Query(query): Query<OwnerQuery>,
) -> Json<Vec<Subscription>> {
    let subscriptions = state
        .subscriptions
        .lock()
        .expect("subscriptions lock")
        .iter()
        .filter(|s| query.owner.as_ref().is_none_or(|owner| s.owner_id == *owner))
        .cloned()
        .collect();
    Json(subscriptions)
}

async fn delete_subscription(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> StatusCode {
    let mut subscriptions = state.subscriptions.lock().expect("subscriptions lock");
    let before = subscriptions.len();
    subscriptions.retain(|s| s.id != id);
    if subscriptions.len() == before {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

async fn create_webhook(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CreateWebhookRequest>,
) -> Json<Webhook> {
    let webhook = Webhook {
        id: state.next_id("webhook-"),
        owner_id: request.owner_id,
        url: request.url,
    };
    state.webhooks.lock().expect("webhooks lock").push(webhook.clone());
    Json(webhook)
}

async fn list_webhooks(
    State(state): State<Arc<MockState>>,
    Query(query): Query<OwnerQuery>,
) -> Json<Vec<Webhook>> {
    let webhooks = state
        .webhooks
        .lock()
        .expect("webhooks lock")
        .iter()
        .filter(|w| query.owner.as_ref().is_none_or(|owner| w.owner_id == *owner))
        .cloned()
        .collect();
    Json(webhooks)
}

async fn delete_webhook(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> StatusCode {
    let mut webhooks = state.webhooks.lock().expect("webhooks lock");
    let before = webhooks.len();
    webhooks.retain(|w| w.id != id);
    if webhooks.len() == before {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

// -- databases and migrations -----------------------------------------------

async fn list_databases(State(state): State<Arc<MockState>>) -> Json<Vec<MultitenantDatabase>> {
    Json(state.databases.lock().expect("databases lock").clone())
}

async fn migrate_database(
    State(state): State<Arc<MockState>>,
    Json(request): Json<MigrateDatabaseRequest>,
) -> impl IntoResponse {
    if !state
        .installations
        .lock()
        .expect("installations lock")
        .contains_key(&request.installation_id)
    {
        return StatusCode::NOT_FOUND.into_response();
    }
    let source_database_id = state
        .databases
        .lock()
        .expect("databases lock")
        .iter()
        .find(|db| db.installation_ids.iter().any(|id| *id == request.installation_id))
        .map(|db| db.id.clone())
        .unwrap_or_default();

    let operation = InstallationDbMigrationOperation {
        id: state.next_id("migration-"),
        installation_id: request.installation_id,
        state: migration_state::REQUESTED.to_string(),
        source_database_id,
        destination_database_id: request.destination_database_id,
    };
    state
        .migrations
        .lock()
        .expect("migrations lock")
        .insert(operation.id.clone(), operation.clone());
    MockState::run_migration(&state, operation.id.clone());
    Json(operation).into_response()
}

async fn get_migration(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.migrations.lock().expect("migrations lock").get(&id) {
        Some(operation) => Json(operation.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn commit_migration(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut migrations = state.migrations.lock().expect("migrations lock");
    let Some(operation) = migrations.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if operation.state != migration_state::SUCCEEDED {
        return (
            StatusCode::CONFLICT,
            format!("cannot commit migration in state {}", operation.state),
        )
            .into_response();
    }
    operation.state = migration_state::COMMITTED.to_string();
    Json(operation.clone()).into_response()
}

async fn rollback_migration(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let operation = {
        let mut migrations = state.migrations.lock().expect("migrations lock");
        let Some(operation) = migrations.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if operation.state != migration_state::SUCCEEDED {
            return (
                StatusCode::CONFLICT,
                format!("cannot roll back migration in state {}", operation.state),
            )
                .into_response();
        }
        operation.state = migration_state::ROLLBACK_REQUESTED.to_string();
        operation.clone()
    };
    MockState::run_rollback(&state, operation.id.clone());
    Json(operation).into_response()
}

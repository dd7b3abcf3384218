//! Lifecycle webhook intake and single-consumer delivery.

pub mod waiter;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use skiff_client::api::webhooks;
use skiff_client::models::{CreateWebhookRequest, WebhookPayload};
use skiff_client::Client;

use crate::serve::{self, ServerHandle};

/// Single-consumer delivery channel for webhook payloads.
///
/// The channel holds at most one payload and the intake handler awaits the
/// send, so the publisher is back-pressured until the consumer catches up.
/// The receiver sits behind an async mutex: a second concurrent consumer
/// would silently steal notifications from the first, so waiters serialize
/// on the lock instead.
pub struct WebhookChannel {
    receiver: tokio::sync::Mutex<mpsc::Receiver<WebhookPayload>>,
}

impl WebhookChannel {
    fn new(receiver: mpsc::Receiver<WebhookPayload>) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Take the consumer side for the duration of one wait.
    pub async fn consume(&self) -> WebhookConsumer<'_> {
        WebhookConsumer {
            guard: self.receiver.lock().await,
        }
    }
}

/// Exclusive hold on the channel's receiving end.
pub struct WebhookConsumer<'a> {
    guard: tokio::sync::MutexGuard<'a, mpsc::Receiver<WebhookPayload>>,
}

impl WebhookConsumer<'_> {
    /// Next payload, or `None` once the sink has shut down.
    pub async fn recv(&mut self) -> Option<WebhookPayload> {
        self.guard.recv().await
    }
}

/// Receives lifecycle webhooks from the control plane and forwards them to
/// the in-process [`WebhookChannel`].
pub struct WebhookSink {
    listen_url: String,
    owner_id: String,
    sender: mpsc::Sender<WebhookPayload>,
    channel: Arc<WebhookChannel>,
    server: Option<ServerHandle>,
    webhook_id: Option<String>,
}

impl WebhookSink {
    /// `listen_url` doubles as the bind address and the delivery URL handed
    /// to the control plane, e.g. `http://localhost:11111`.
    pub fn new(listen_url: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            listen_url: listen_url.into(),
            owner_id: owner_id.into(),
            sender,
            channel: Arc::new(WebhookChannel::new(receiver)),
            server: None,
            webhook_id: None,
        }
    }

    /// The delivery channel waiters consume from.
    pub fn channel(&self) -> Arc<WebhookChannel> {
        Arc::clone(&self.channel)
    }

    /// Start the intake server and register the webhook, reusing an
    /// existing registration by this owner for the same URL. Registration
    /// failure shuts the server down again.
    pub async fn start(&mut self, client: &Client) -> Result<()> {
        let addr = serve::socket_addr_of(&self.listen_url)?;
        let router = Router::new()
            .route("/", post(receive_webhook))
            .with_state(self.sender.clone())
            .layer(TraceLayer::new_for_http());
        let server = serve::spawn(addr, router)
            .await
            .context("failed to start webhook sink server")?;

        match self.ensure_webhook(client).await {
            Ok(webhook_id) => {
                tracing::info!(
                    listen_url = %self.listen_url,
                    webhook_id = %webhook_id,
                    "webhook sink started"
                );
                self.webhook_id = Some(webhook_id);
                self.server = Some(server);
                Ok(())
            }
            Err(err) => {
                server.shutdown().await;
                Err(err.context("failed to register webhook"))
            }
        }
    }

    async fn ensure_webhook(&self, client: &Client) -> Result<String> {
        let existing = webhooks::list_webhooks(client, &self.owner_id)
            .await
            .context("failed to list webhooks")?;
        if let Some(webhook) = existing.into_iter().find(|w| w.url == self.listen_url) {
            return Ok(webhook.id);
        }

        let webhook = webhooks::create_webhook(
            client,
            &CreateWebhookRequest {
                owner_id: self.owner_id.clone(),
                url: self.listen_url.clone(),
            },
        )
        .await
        .context("failed to create webhook")?;
        Ok(webhook.id)
    }

    /// Stop the server and delete the registration; failures are logged.
    pub async fn shutdown(&mut self, client: &Client) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        if let Some(webhook_id) = self.webhook_id.take() {
            if let Err(err) = webhooks::delete_webhook(client, &webhook_id).await {
                tracing::warn!(
                    webhook_id = %webhook_id,
                    error = %format!("{err:#}"),
                    "failed to delete webhook registration"
                );
            }
        }
    }
}

/// Intake handler. Decode failures and empty-ID payloads are dropped with a
/// warning; the response is 200 either way so the publisher never retries.
async fn receive_webhook(State(sender): State<mpsc::Sender<WebhookPayload>>, body: Bytes) -> StatusCode {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "discarding undecodable webhook payload");
            return StatusCode::OK;
        }
    };

    if payload.id.is_empty() {
        tracing::warn!("discarding webhook payload with empty resource ID");
        return StatusCode::OK;
    }

    if sender.send(payload).await.is_err() {
        tracing::warn!("webhook channel closed, payload dropped");
    }
    StatusCode::OK
}

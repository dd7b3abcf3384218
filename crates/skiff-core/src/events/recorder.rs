//! HTTP intake and ordered verification of state-change events.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use skiff_client::api::subscriptions;
use skiff_client::models::{CreateSubscriptionRequest, StateChangeEventPayload};
use skiff_client::Client;

use super::{EventOccurrence, RecordMask};
use crate::serve::{self, ServerHandle};

/// Receives state-change events from the control plane and keeps the ones
/// matching its mask, in arrival order, for post-run verification.
pub struct EventRecorder {
    listen_url: String,
    owner_id: String,
    shared: Arc<Shared>,
    server: Option<ServerHandle>,
    subscription_id: Option<String>,
}

struct Shared {
    mask: RecordMask,
    history: Mutex<Vec<StateChangeEventPayload>>,
}

impl EventRecorder {
    /// `listen_url` doubles as the bind address and the delivery URL handed
    /// to the control plane, e.g. `http://localhost:11112`.
    pub fn new(listen_url: impl Into<String>, owner_id: impl Into<String>, mask: RecordMask) -> Self {
        Self {
            listen_url: listen_url.into(),
            owner_id: owner_id.into(),
            shared: Arc::new(Shared {
                mask,
                history: Mutex::new(Vec::new()),
            }),
            server: None,
            subscription_id: None,
        }
    }

    /// Start the intake server and register the subscription. If
    /// registration fails the server is shut down again so the port is
    /// released.
    pub async fn start(&mut self, client: &Client) -> Result<()> {
        let addr = serve::socket_addr_of(&self.listen_url)?;
        let router = Router::new()
            .route("/", post(receive_event))
            .with_state(Arc::clone(&self.shared))
            .layer(TraceLayer::new_for_http());
        let server = serve::spawn(addr, router)
            .await
            .context("failed to start event recorder server")?;

        match self.ensure_subscription(client).await {
            Ok(subscription_id) => {
                tracing::info!(
                    listen_url = %self.listen_url,
                    subscription_id = %subscription_id,
                    "event recorder started"
                );
                self.subscription_id = Some(subscription_id);
                self.server = Some(server);
                Ok(())
            }
            Err(err) => {
                server.shutdown().await;
                Err(err.context("failed to register event subscription"))
            }
        }
    }

    /// Reuse a subscription this owner already points at our URL, otherwise
    /// create one. Reuse keeps repeated harness runs against shared
    /// infrastructure from piling up registrations.
    async fn ensure_subscription(&self, client: &Client) -> Result<String> {
        let existing = subscriptions::list_subscriptions(client, &self.owner_id)
            .await
            .context("failed to list subscriptions")?;
        if let Some(subscription) = existing.into_iter().find(|s| s.url == self.listen_url) {
            return Ok(subscription.id);
        }

        let subscription = subscriptions::create_subscription(
            client,
            &CreateSubscriptionRequest {
                owner_id: self.owner_id.clone(),
                url: self.listen_url.clone(),
            },
        )
        .await
        .context("failed to create subscription")?;
        Ok(subscription.id)
    }

    /// Stop the server and delete the subscription. Failures are logged
    /// rather than surfaced: shutdown runs on paths that already have an
    /// error to report.
    pub async fn shutdown(&mut self, client: &Client) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        if let Some(subscription_id) = self.subscription_id.take() {
            if let Err(err) = subscriptions::delete_subscription(client, &subscription_id).await {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %format!("{err:#}"),
                    "failed to delete event subscription"
                );
            }
        }
    }

    /// Snapshot of the recorded history in arrival order.
    pub fn history(&self) -> Vec<StateChangeEventPayload> {
        self.shared
            .history
            .lock()
            .expect("event history lock poisoned")
            .clone()
    }

    /// Check that the recorded history contains every expected occurrence
    /// in order, tolerating swaps of adjacent expected entries.
    pub fn verify_in_order(&self, expected: Vec<EventOccurrence>) -> Result<(), VerifyError> {
        verify_ordered(&self.history(), expected)
    }
}

/// Ordered verification failed.
#[derive(Debug, Error)]
#[error("verified {verified} event(s), first unverified: {first_unverified}")]
pub struct VerifyError {
    pub verified: usize,
    pub first_unverified: EventOccurrence,
}

/// Scan `history` against `expected`, consuming expected entries in order.
///
/// A recorded event matching `expected[1]` instead of the head consumes the
/// second entry and marks the head as displaced; a displaced head must be
/// matched before any further out-of-order consumption. The effect is that
/// the expected order may differ from arrival order by swaps of adjacent
/// entries only, which absorbs the known supervisor race between cluster and
/// cluster-installation transitions without accepting real reordering bugs.
fn verify_ordered(
    history: &[StateChangeEventPayload],
    mut expected: Vec<EventOccurrence>,
) -> Result<(), VerifyError> {
    let mut verified = 0usize;
    let mut head_displaced = false;

    for payload in history {
        if expected.is_empty() {
            break;
        }
        let occurred = EventOccurrence::from(payload);
        if expected[0] == occurred {
            expected.remove(0);
            verified += 1;
            head_displaced = false;
            continue;
        }
        if !head_displaced && expected.len() > 1 && expected[1] == occurred {
            expected.remove(1);
            verified += 1;
            head_displaced = true;
        }
    }

    match expected.into_iter().next() {
        None => Ok(()),
        Some(first_unverified) => Err(VerifyError {
            verified,
            first_unverified,
        }),
    }
}

/// Intake handler. Always answers 200: a non-2xx would make the publisher
/// retry, and a frame that fails to decode will not decode better the
/// second time.
async fn receive_event(State(shared): State<Arc<Shared>>, body: Bytes) -> StatusCode {
    let payload: StateChangeEventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "discarding undecodable event payload");
            return StatusCode::OK;
        }
    };

    if !shared.mask.contains(payload.resource_type) {
        return StatusCode::OK;
    }

    tracing::debug!(
        resource_type = %payload.resource_type,
        resource_id = %payload.resource_id,
        old_state = %payload.old_state,
        new_state = %payload.new_state,
        "recorded state-change event"
    );
    shared
        .history
        .lock()
        .expect("event history lock poisoned")
        .push(payload);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_client::models::ResourceType;

    fn payload(rt: ResourceType, id: &str, old: &str, new: &str) -> StateChangeEventPayload {
        StateChangeEventPayload {
            event_id: String::new(),
            resource_type: rt,
            resource_id: id.to_string(),
            old_state: old.to_string(),
            new_state: new.to_string(),
            timestamp: 0,
            extra: serde_json::Map::new(),
        }
    }

    fn occurrence(rt: ResourceType, id: &str, old: &str, new: &str) -> EventOccurrence {
        EventOccurrence::new(rt, id, old, new)
    }

    #[test]
    fn empty_expected_always_verifies() {
        assert!(verify_ordered(&[], Vec::new()).is_ok());
        let history = [payload(ResourceType::Cluster, "c1", "n/a", "creation-requested")];
        assert!(verify_ordered(&history, Vec::new()).is_ok());
    }

    #[test]
    fn verifies_exact_order() {
        let history = [
            payload(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            payload(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
            payload(ResourceType::Installation, "i1", "n/a", "creation-requested"),
        ];
        let expected = vec![
            occurrence(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            occurrence(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
            occurrence(ResourceType::Installation, "i1", "n/a", "creation-requested"),
        ];
        assert!(verify_ordered(&history, expected).is_ok());
    }

    #[test]
    fn tolerates_adjacent_swap() {
        let history = [
            payload(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            payload(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
            payload(ResourceType::Installation, "i1", "n/a", "creation-requested"),
        ];
        // Expected order swaps the last two relative to arrival.
        let expected = vec![
            occurrence(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            occurrence(ResourceType::Installation, "i1", "n/a", "creation-requested"),
            occurrence(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
        ];
        assert!(verify_ordered(&history, expected).is_ok());
    }

    #[test]
    fn rejects_two_position_displacement() {
        let history = [
            payload(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            payload(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
            payload(ResourceType::Installation, "i1", "n/a", "creation-requested"),
        ];
        // The installation event arrived last but is expected first: a
        // displacement of two positions.
        let expected = vec![
            occurrence(ResourceType::Installation, "i1", "n/a", "creation-requested"),
            occurrence(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            occurrence(ResourceType::ClusterInstallation, "ci1", "n/a", "creation-requested"),
        ];
        let err = verify_ordered(&history, expected).unwrap_err();
        assert_eq!(err.verified, 2);
        assert_eq!(err.first_unverified.resource_id, "ci1");
    }

    #[test]
    fn tolerates_disjoint_swaps() {
        let history = [
            payload(ResourceType::Cluster, "b", "1", "2"),
            payload(ResourceType::Cluster, "a", "1", "2"),
            payload(ResourceType::Cluster, "d", "1", "2"),
            payload(ResourceType::Cluster, "c", "1", "2"),
        ];
        let expected = vec![
            occurrence(ResourceType::Cluster, "a", "1", "2"),
            occurrence(ResourceType::Cluster, "b", "1", "2"),
            occurrence(ResourceType::Cluster, "c", "1", "2"),
            occurrence(ResourceType::Cluster, "d", "1", "2"),
        ];
        assert!(verify_ordered(&history, expected).is_ok());
    }

    #[test]
    fn ignores_unexpected_events_between_matches() {
        let history = [
            payload(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            payload(ResourceType::Cluster, "other", "stable", "deleted"),
            payload(ResourceType::Cluster, "c1", "creation-requested", "stable"),
        ];
        let expected = vec![
            occurrence(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            occurrence(ResourceType::Cluster, "c1", "creation-requested", "stable"),
        ];
        assert!(verify_ordered(&history, expected).is_ok());
    }

    #[test]
    fn names_first_unmatched_expected() {
        let history = [payload(ResourceType::Cluster, "c1", "n/a", "creation-requested")];
        let expected = vec![
            occurrence(ResourceType::Cluster, "c1", "n/a", "creation-requested"),
            occurrence(ResourceType::Cluster, "c1", "creation-requested", "stable"),
        ];
        let err = verify_ordered(&history, expected).unwrap_err();
        assert_eq!(err.verified, 1);
        assert_eq!(err.first_unverified.new_state, "stable");
    }
}

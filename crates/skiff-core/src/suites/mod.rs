//! Domain operation suites: the step actions of the shipped workflows.

pub mod cluster;
pub mod installation;
pub mod migration;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::wait::{WaitConfig, wait_until};

// Per-phase deadlines. Cluster and installation provisioning dominate test
// runtime; the shorter phases are expected to settle quickly and a longer
// wait only delays the diagnosis.
pub const CLUSTER_STATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const INSTALLATION_STATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const HIBERNATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const STABLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DELETION_PENDING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DELETION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default pause between remote polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll `fetch` until the resource reports one of `targets` (returned) or
/// one of `failures` (error). States outside both sets keep the poll going.
pub(crate) async fn poll_until_state<F, Fut>(
    config: &WaitConfig,
    what: &str,
    targets: &[&str],
    failures: &[&str],
    mut fetch: F,
) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let reached = wait_until(config, || {
        let fut = fetch();
        async move {
            let state = fut.await?;
            let settled = targets.iter().chain(failures).any(|s| *s == state);
            Ok(settled.then_some(state))
        }
    })
    .await
    .with_context(|| format!("waiting for {what} to reach one of {targets:?}"))?;

    if failures.contains(&reached.as_str()) {
        bail!("{what} reached failure state {reached:?}");
    }
    Ok(reached)
}

/// Poll `fetch` until the resource reports `target`, requiring every
/// intermediate state to be one of `allowed`. Any other state fails the
/// wait immediately.
pub(crate) async fn poll_transition<F, Fut>(
    config: &WaitConfig,
    what: &str,
    target: &str,
    allowed: &[&str],
    mut fetch: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let reached = wait_until(config, || {
        let fut = fetch();
        async move {
            let state = fut.await?;
            if state == target || !allowed.contains(&state.as_str()) {
                Ok(Some(state))
            } else {
                Ok(None)
            }
        }
    })
    .await
    .with_context(|| format!("waiting for {what} to reach {target:?}"))?;

    if reached != target {
        bail!("{what} moved to unexpected state {reached:?} while waiting for {target:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> WaitConfig {
        WaitConfig {
            timeout: Duration::from_millis(500),
            interval: Duration::from_millis(2),
            tolerated_errors: 2,
        }
    }

    #[tokio::test]
    async fn poll_until_state_returns_target() {
        let calls = AtomicUsize::new(0);
        let state = poll_until_state(&fast(), "cluster c1", &["stable"], &["creation-failed"], || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match n {
                    0 => "creation-requested".to_string(),
                    1 => "provision-in-progress".to_string(),
                    _ => "stable".to_string(),
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(state, "stable");
    }

    #[tokio::test]
    async fn poll_until_state_fails_on_terminal_state() {
        let err = poll_until_state(&fast(), "cluster c1", &["stable"], &["creation-failed"], || async {
            Ok("creation-failed".to_string())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("creation-failed"));
    }

    #[tokio::test]
    async fn poll_transition_rejects_unexpected_intermediate() {
        let err = poll_transition(
            &fast(),
            "installation i1",
            "hibernating",
            &["stable", "hibernation-requested"],
            || async { Ok("deletion-requested".to_string()) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unexpected state"));
    }

    #[tokio::test]
    async fn poll_transition_walks_allowed_states() {
        let calls = AtomicUsize::new(0);
        poll_transition(
            &fast(),
            "installation i1",
            "hibernating",
            &["stable", "hibernation-requested"],
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(match n {
                        0 => "stable".to_string(),
                        1 => "hibernation-requested".to_string(),
                        _ => "hibernating".to_string(),
                    })
                }
            },
        )
        .await
        .unwrap();
    }
}

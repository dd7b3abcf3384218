//! Polling wait primitive shared by every poller in the harness.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Parameters for one polling wait.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Overall deadline. The deadline is checked before each probe, so the
    /// actual elapsed time can run over by up to one `interval` plus the
    /// duration of the final probe.
    pub timeout: Duration,
    /// Pause between probes.
    pub interval: Duration,
    /// How many consecutive probe errors to absorb before surfacing the
    /// last one. Remote polls routinely hit transient 5xx during control
    /// plane failover; a not-ready probe resets the counter.
    pub tolerated_errors: usize,
}

impl WaitConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            tolerated_errors: 5,
        }
    }
}

/// Why a wait did not produce a value.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    // anyhow::Error is not a std Error, so it rides along as a display
    // field rather than a source.
    #[error("probe failed {attempts} consecutive times: {error:#}")]
    Probe { attempts: usize, error: anyhow::Error },
}

/// Repeatedly invoke `probe` until it yields a value, the deadline elapses,
/// or it errors more than `tolerated_errors` times in a row.
///
/// `Ok(Some(v))` completes the wait with `v`; `Ok(None)` means not ready yet
/// and resets the consecutive-error counter. The primitive does not observe
/// external cancellation beyond its own deadline; callers that need it wrap
/// the returned future.
pub async fn wait_until<T, F, Fut>(config: &WaitConfig, mut probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut consecutive_errors = 0usize;

    loop {
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout(config.timeout));
        }

        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => consecutive_errors = 0,
            Err(err) => {
                consecutive_errors += 1;
                if consecutive_errors > config.tolerated_errors {
                    return Err(WaitError::Probe {
                        attempts: consecutive_errors,
                        error: err,
                    });
                }
                tracing::debug!(
                    consecutive_errors,
                    error = %format!("{err:#}"),
                    "wait probe failed, retrying"
                );
            }
        }

        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(timeout_ms: u64) -> WaitConfig {
        WaitConfig {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(5),
            tolerated_errors: 2,
        }
    }

    #[tokio::test]
    async fn returns_value_once_ready() {
        let calls = AtomicUsize::new(0);
        let value = wait_until(&fast(1000), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n >= 2).then_some("ready")) }
        })
        .await
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let result: Result<(), _> = wait_until(&fast(30), || async { Ok(None) }).await;
        assert!(matches!(result, Err(WaitError::Timeout(_))));
    }

    #[tokio::test]
    async fn surfaces_error_past_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = wait_until(&fast(1000), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("boom")) }
        })
        .await;
        match result {
            Err(WaitError::Probe { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected probe error, got {other:?}"),
        }
        // tolerated_errors = 2, so the third consecutive failure surfaces.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_ready_resets_error_counter() {
        let calls = AtomicUsize::new(0);
        let result = wait_until(&fast(1000), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    // two errors, a not-ready, two more errors: never past
                    // the budget of 2
                    0 | 1 | 3 | 4 => Err(anyhow!("transient")),
                    2 => Ok(None),
                    _ => Ok(Some(())),
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}

//! Shared plumbing for the harness's inbound HTTP servers.

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Extract the bind address from a listen URL of the form `http://host:port`.
pub(crate) fn socket_addr_of(listen_url: &str) -> Result<SocketAddr> {
    let Some(rest) = listen_url.strip_prefix("http://") else {
        bail!("listen URL {listen_url:?} must start with http://");
    };
    let host_port = rest.trim_end_matches('/');
    let (host, port) = host_port
        .rsplit_once(':')
        .with_context(|| format!("listen URL {listen_url:?} is missing a port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("listen URL {listen_url:?} has an invalid port"))?;

    // "localhost" is the common case in configs; resolve it statically so
    // binding does not depend on the resolver.
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("listen URL {listen_url:?} has an invalid host"))
}

/// A running HTTP server that can be shut down gracefully.
pub(crate) struct ServerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight handlers to drain,
    /// up to a short grace deadline. A handler parked on a full channel must
    /// not be able to wedge teardown.
    pub(crate) async fn shutdown(self) {
        const GRACE: std::time::Duration = std::time::Duration::from_secs(5);

        self.shutdown.cancel();
        let mut task = self.task;
        match tokio::time::timeout(GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "inbound server task panicked during shutdown");
            }
            Err(_) => {
                tracing::warn!("inbound server did not drain within {GRACE:?}, aborting");
                task.abort();
            }
        }
    }
}

/// Bind `addr` and serve `router` on a background task until shut down.
pub(crate) async fn spawn(addr: SocketAddr, router: Router) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "inbound server exited with error");
        }
    });

    Ok(ServerHandle { shutdown, task })
}

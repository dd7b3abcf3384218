//! Kubernetes file-extraction capability.
//!
//! The bulk-export step needs one thing from the cluster itself: the export
//! file written inside the application pod. That single operation sits
//! behind an object-safe trait so tests can substitute a fake instead of a
//! live cluster.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Copies files out of the application pod of a cluster installation.
#[async_trait]
pub trait PodFileCopier: Send + Sync {
    /// Copy `remote_path` from the first pod matching `pod_selector` in
    /// `namespace` to `local_path` on this machine.
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod_selector: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()>;
}

/// [`PodFileCopier`] backed by the `kubectl` CLI.
#[derive(Debug, Default)]
pub struct KubectlCopier {
    /// Explicit kubeconfig; `None` uses kubectl's own resolution.
    pub kubeconfig: Option<PathBuf>,
}

impl KubectlCopier {
    fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd
    }

    /// Resolve the first pod matching the label selector.
    async fn find_pod(&self, namespace: &str, pod_selector: &str) -> Result<String> {
        let output = self
            .command()
            .args([
                "get",
                "pods",
                "-n",
                namespace,
                "-l",
                pod_selector,
                "-o",
                "jsonpath={.items[0].metadata.name}",
            ])
            .output()
            .await
            .context("failed to run kubectl get pods")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("kubectl get pods failed in namespace {namespace}: {stderr}");
        }

        let pod = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if pod.is_empty() {
            bail!("no pod matches selector {pod_selector:?} in namespace {namespace}");
        }
        Ok(pod)
    }
}

#[async_trait]
impl PodFileCopier for KubectlCopier {
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod_selector: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let pod = self.find_pod(namespace, pod_selector).await?;

        tracing::info!(
            namespace,
            pod = %pod,
            remote_path,
            local_path = %local_path.display(),
            "copying file out of pod"
        );
        let output = self
            .command()
            .args([
                "cp",
                &format!("{namespace}/{pod}:{remote_path}"),
                &local_path.to_string_lossy(),
            ])
            .output()
            .await
            .context("failed to run kubectl cp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("kubectl cp from {namespace}/{pod}:{remote_path} failed: {stderr}");
        }
        Ok(())
    }
}

// Object safety is what lets suites hold `Arc<dyn PodFileCopier>`.
const _: () = {
    fn _assert_object_safe(_: &dyn PodFileCopier) {}
};

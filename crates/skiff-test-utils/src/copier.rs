//! Fake pod file copier backed by a fixture string.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use skiff_core::kube::PodFileCopier;

/// [`PodFileCopier`] that writes a fixed fixture instead of reaching a
/// cluster. Every copy produces the same content, which is exactly what the
/// migration assertions need: identical export counts before and after.
#[derive(Debug, Clone)]
pub struct FixtureFileCopier {
    content: String,
}

impl FixtureFileCopier {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait]
impl PodFileCopier for FixtureFileCopier {
    async fn copy_from_pod(
        &self,
        _namespace: &str,
        _pod_selector: &str,
        _remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        tokio::fs::write(local_path, &self.content)
            .await
            .with_context(|| format!("failed to write fixture to {}", local_path.display()))
    }
}

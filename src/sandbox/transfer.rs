//! Host <-> environment file exchange, outside the declared mounts.
//!
//! Used for transient generated artifacts (a script written mid-session,
//! a result file pulled back out). No retries: the caller decides whether
//! to retry or to fall back to the mounted directory.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::manager::{SandboxManager, SandboxStatus};
use super::SandboxError;

/// Copies files and directories between host and running environment.
pub struct FileGateway {
    manager: Arc<SandboxManager>,
}

impl FileGateway {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }

    /// Copies a host file or directory into the environment.
    pub async fn put(&self, host: &Path, container: &str) -> Result<(), SandboxError> {
        if !host.exists() {
            return Err(SandboxError::Transfer(format!(
                "host path {} does not exist",
                host.display()
            )));
        }
        self.require_running().await?;

        self.manager
            .engine()
            .copy_in(self.manager.container_name(), host, container)
            .await?;
        info!(host = %host.display(), container, "copied into sandbox");
        Ok(())
    }

    /// Copies a file or directory out of the environment to the host.
    pub async fn get(&self, container: &str, host: &Path) -> Result<(), SandboxError> {
        self.require_running().await?;

        self.manager
            .engine()
            .copy_out(self.manager.container_name(), container, host)
            .await?;
        info!(container, host = %host.display(), "copied out of sandbox");
        Ok(())
    }

    async fn require_running(&self) -> Result<(), SandboxError> {
        match self.manager.status().await {
            Some(SandboxStatus::Running) => Ok(()),
            other => Err(SandboxError::Transfer(format!(
                "environment is not running (status: {other:?})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::{test_config, FakeEngine};
    use crate::sandbox::ContainerEngine;

    async fn gateway(engine: &Arc<FakeEngine>, start: bool) -> FileGateway {
        let manager = Arc::new(SandboxManager::new(
            Arc::clone(engine) as Arc<dyn ContainerEngine>,
            test_config(),
        ));
        if start {
            manager.start().await.unwrap();
        }
        FileGateway::new(manager)
    }

    #[tokio::test]
    async fn test_put_missing_source_fails_without_engine_call() {
        let engine = Arc::new(FakeEngine::up());
        let gw = gateway(&engine, true).await;

        let err = gw
            .put(Path::new("/tmp/hermit-no-such-file"), "/tmp/dest")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Transfer(_)));
        assert!(!engine.call_log().iter().any(|c| c.starts_with("copy_in")));
    }

    #[tokio::test]
    async fn test_put_requires_running_environment() {
        let engine = Arc::new(FakeEngine::up());
        let gw = gateway(&engine, false).await;
        let file = tempfile::NamedTempFile::new().unwrap();

        let err = gw.put(file.path(), "/tmp/dest").await.unwrap_err();
        assert!(matches!(err, SandboxError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_put_copies_into_container() {
        let engine = Arc::new(FakeEngine::up());
        let gw = gateway(&engine, true).await;
        let file = tempfile::NamedTempFile::new().unwrap();

        gw.put(file.path(), "/tmp/dest.txt").await.unwrap();
        assert!(engine.call_log().iter().any(|c| c.starts_with("copy_in")));
    }

    #[tokio::test]
    async fn test_get_requires_running_environment() {
        let engine = Arc::new(FakeEngine::up());
        let gw = gateway(&engine, false).await;

        let err = gw
            .get("/tmp/out.txt", Path::new("/tmp/local.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_get_copies_out_of_container() {
        let engine = Arc::new(FakeEngine::up());
        let gw = gateway(&engine, true).await;

        gw.get("/tmp/out.txt", Path::new("/tmp/local.txt"))
            .await
            .unwrap();
        assert!(engine.call_log().iter().any(|c| c.starts_with("copy_out")));
    }
}

//! Exactly-once teardown on every exit path.
//!
//! The registrar is armed the moment the sandbox reaches Running. The
//! normal-exit path and the signal path may both reach it in a race; an
//! atomic guard makes sure only the first invocation performs real work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::manager::SandboxManager;

/// If teardown itself hangs this long, exit anyway: the next `start()`
/// removes the stale container by name.
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct CleanupRegistrar {
    manager: Arc<SandboxManager>,
    done: AtomicBool,
}

impl CleanupRegistrar {
    /// Arms teardown for a running sandbox.
    pub fn arm(manager: Arc<SandboxManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            done: AtomicBool::new(false),
        })
    }

    /// Runs teardown exactly once. Reentrant-safe: later (or concurrent)
    /// invocations observe the guard and no-op. Never fails the caller.
    pub async fn teardown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(container = %self.manager.container_name(), "tearing down sandbox");
        match tokio::time::timeout(TEARDOWN_GRACE, self.manager.stop()).await {
            Ok(_) => {}
            Err(_) => warn!(
                grace_secs = TEARDOWN_GRACE.as_secs(),
                "teardown did not finish in time; the next start will remove the stale container"
            ),
        }
    }

    /// Whether teardown already ran.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::{test_config, FakeEngine};
    use crate::sandbox::{ContainerEngine, SandboxStatus};

    async fn armed(engine: &Arc<FakeEngine>) -> (Arc<SandboxManager>, Arc<CleanupRegistrar>) {
        let manager = Arc::new(SandboxManager::new(
            Arc::clone(engine) as Arc<dyn ContainerEngine>,
            test_config(),
        ));
        manager.start().await.unwrap();
        let registrar = CleanupRegistrar::arm(Arc::clone(&manager));
        (manager, registrar)
    }

    #[tokio::test]
    async fn test_teardown_stops_the_sandbox() {
        let engine = Arc::new(FakeEngine::up());
        let (manager, registrar) = armed(&engine).await;

        registrar.teardown().await;
        assert!(registrar.is_done());
        assert_eq!(manager.status().await, Some(SandboxStatus::Stopped));
    }

    #[tokio::test]
    async fn test_teardown_runs_exactly_once() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, registrar) = armed(&engine).await;

        registrar.teardown().await;
        let removes_after_first = remove_count(&engine);
        registrar.teardown().await;
        assert_eq!(remove_count(&engine), removes_after_first);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_race_is_safe() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, registrar) = armed(&engine).await;

        // Normal-exit path and signal path racing
        let a = Arc::clone(&registrar);
        let b = Arc::clone(&registrar);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.teardown().await }),
            tokio::spawn(async move { b.teardown().await }),
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(remove_count(&engine), 1);
    }

    fn remove_count(engine: &FakeEngine) -> usize {
        engine
            .call_log()
            .iter()
            .filter(|c| c.starts_with("remove:"))
            .count()
    }
}

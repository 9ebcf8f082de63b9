//! Sandbox lifecycle: owns the single running execution environment.
//!
//! Provisioning is the only phase allowed to be fatal. Once the sandbox is
//! running, every later operation either self-heals (`ensure_running`) or
//! degrades to a warning — the session must not depend on the container
//! surviving external interference.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::engine::{ContainerEngine, ContainerState};
use super::{ContainerSpec, SandboxConfig, SandboxError};

/// Lifecycle state of the managed environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
}

/// Runtime identity of a started environment.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Engine-assigned opaque container id.
    pub container_id: String,
    pub status: SandboxStatus,
    pub started_at: DateTime<Utc>,
}

/// Mutable lifecycle state, guarded by one lock.
/// The env temp file lives here so it exists as long as the container does.
#[derive(Default)]
struct HandleState {
    handle: Option<SandboxHandle>,
    env_file: Option<NamedTempFile>,
}

/// Owns the sandbox container for the process lifetime. All other
/// components borrow it for the duration of one call.
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfig,
    state: Mutex<HandleState>,
    /// Serializes `run` calls: the container has a single foreground of
    /// attention, so command N+1 must not start before N has returned.
    exec_lock: Mutex<()>,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfig) -> Self {
        Self {
            engine,
            config,
            state: Mutex::new(HandleState::default()),
            exec_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn container_name(&self) -> &str {
        &self.config.container_name
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub(crate) fn exec_lock(&self) -> &Mutex<()> {
        &self.exec_lock
    }

    /// Current lifecycle status, None if `start` never succeeded.
    pub async fn status(&self) -> Option<SandboxStatus> {
        self.state.lock().await.handle.as_ref().map(|h| h.status)
    }

    /// Start timestamp of the running environment, if any.
    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .handle
            .as_ref()
            .map(|h| h.started_at)
    }

    /// Provisions and starts the environment.
    ///
    /// Verifies the engine daemon is reachable before any container
    /// operation, removes a leftover container with our name from a prior
    /// unclean shutdown, then creates a fresh one with the resolved mounts
    /// and merged environment. No interactive terminal is attached.
    pub async fn start(&self) -> Result<(), SandboxError> {
        self.engine.ping().await?;

        let name = &self.config.container_name;
        if self.engine.state(name).await? != ContainerState::Missing {
            info!(container = %name, "removing stale container from a previous run");
            self.engine
                .remove(name)
                .await
                .map_err(|e| SandboxError::Provision(format!("stale container {name}: {e}")))?;
        }

        let mut state = self.state.lock().await;
        state.handle = Some(SandboxHandle {
            container_id: String::new(),
            status: SandboxStatus::Provisioning,
            started_at: Utc::now(),
        });
        match self.provision(&mut state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                state.handle = None;
                state.env_file = None;
                Err(e)
            }
        }
    }

    /// Creates and starts the container, updating the handle. The caller
    /// holds the state lock.
    async fn provision(&self, state: &mut HandleState) -> Result<(), SandboxError> {
        if state.env_file.is_none() {
            state.env_file = write_env_file(&self.config.env)?;
        }

        let spec = ContainerSpec {
            name: self.config.container_name.clone(),
            image: self.config.image.clone(),
            mounts: self.config.mounts.clone(),
            env_file: state.env_file.as_ref().map(|f| f.path().to_path_buf()),
        };

        let container_id = self.engine.create_and_start(&spec).await?;
        info!(
            container = %spec.name,
            image = %spec.image,
            mounts = spec.mounts.len(),
            "sandbox running"
        );

        state.handle = Some(SandboxHandle {
            container_id,
            status: SandboxStatus::Running,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// Idempotent check-and-restart. If the container exited or was removed
    /// out-of-band, it is transparently recreated from the original
    /// configuration.
    pub async fn ensure_running(&self) -> Result<(), SandboxError> {
        let name = &self.config.container_name;
        if self.engine.state(name).await? == ContainerState::Running {
            return Ok(());
        }

        warn!(container = %name, "sandbox container gone or stopped, recreating");
        // Clear any half-dead leftover before recreating under the same name.
        if let Err(e) = self.engine.remove(name).await {
            warn!(container = %name, "cleanup before recreate failed: {e}");
        }

        let mut state = self.state.lock().await;
        self.provision(&mut state)
            .await
            .map_err(|e| SandboxError::Execution(format!("recreate failed: {e}")))
    }

    /// Stops and removes the container. Idempotent: safe to call multiple
    /// times or before `start` ever succeeded. Teardown failures are logged
    /// as warnings, never surfaced — this runs on exit paths.
    ///
    /// Returns true if teardown work was actually performed.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(handle) = state.handle.as_mut() else {
            return false;
        };
        if handle.status == SandboxStatus::Stopped {
            return false;
        }
        handle.status = SandboxStatus::Stopping;

        let name = &self.config.container_name;
        match self.engine.remove(name).await {
            Ok(()) => info!(container = %name, "sandbox removed"),
            Err(e) => warn!(container = %name, "teardown: {e}"),
        }

        handle.status = SandboxStatus::Stopped;
        state.env_file = None;
        true
    }
}

/// Writes the merged environment to a private temp file handed to the
/// engine via `--env-file`. None when there is nothing to inject.
fn write_env_file(
    env: &HashMap<String, String>,
) -> Result<Option<NamedTempFile>, SandboxError> {
    if env.is_empty() {
        return Ok(None);
    }

    let mut file = tempfile::Builder::new()
        .prefix(".hermit-env-")
        .suffix(".env")
        .tempfile()
        .map_err(|e| SandboxError::Provision(format!("sandbox env file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| SandboxError::Provision(format!("sandbox env file perms: {e}")))?;
    }

    for (key, value) in env {
        writeln!(file, "{key}={value}")
            .map_err(|e| SandboxError::Provision(format!("sandbox env file: {e}")))?;
    }
    file.flush()
        .map_err(|e| SandboxError::Provision(format!("sandbox env file: {e}")))?;

    Ok(Some(file))
}

pub mod cleanup;
pub mod engine;
pub mod envfile;
pub mod exec;
pub mod manager;
pub mod mounts;
pub mod transfer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use cleanup::CleanupRegistrar;
pub use engine::{ContainerEngine, ContainerState, DockerCli, OutputChunk};
pub use exec::{CommandExecutor, CommandRequest, CommandResult};
pub use manager::{SandboxManager, SandboxStatus};
pub use mounts::{AccessMode, MountDecl, MountSpec};
pub use transfer::FileGateway;

/// Container path where the user's working directory is mounted.
pub const MNT_MOUNT_POINT: &str = "/mnt";

/// Container path where skill/reference material is mounted (read-only).
pub const SKILLS_MOUNT_POINT: &str = "/skills";

/// Errors raised by the sandbox subsystem.
///
/// Command timeouts and non-zero exit codes are *not* errors — they are
/// reported as data in [`CommandResult`] and interpreted by the caller.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The container engine daemon is unreachable. Fatal at startup.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The environment could not be created or started (missing image,
    /// rejected mount, name collision that survived cleanup). Fatal at startup.
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    /// The environment was unexpectedly not running (or the engine failed
    /// mid-call). Recovered once via `ensure_running` before surfacing.
    #[error("sandbox execution failed: {0}")]
    Execution(String),

    /// A put/get transfer failed: missing source or environment down.
    /// Never retried automatically.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// Teardown problem. Logged as a warning, never escalated.
    #[error("sandbox teardown failed: {0}")]
    Teardown(String),
}

impl SandboxError {
    /// True for conditions that must abort the whole program.
    /// Everything after a successful `start()` degrades instead of aborting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::EngineUnavailable(_) | SandboxError::Provision(_)
        )
    }
}

/// Immutable sandbox configuration, built once per process from CLI and
/// environment-supplied values.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image reference (e.g. "ubuntu:24.04").
    pub image: String,
    /// Container name: configured prefix + process id, unique per process.
    pub container_name: String,
    /// Resolved mounts, in declaration order.
    pub mounts: Vec<MountSpec>,
    /// Merged environment injected into the container.
    pub env: HashMap<String, String>,
    /// Default per-command timeout (overridable per request).
    pub command_timeout: Duration,
    /// Timeout for reaching the engine daemon itself.
    pub engine_timeout: Duration,
}

impl SandboxConfig {
    /// Derives the unique container name from a prefix and the process id.
    pub fn container_name_for(prefix: &str) -> String {
        format!("{}-{}", prefix, std::process::id())
    }
}

/// Everything the engine needs to create and start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<MountSpec>,
    /// Path to a KEY=VALUE file passed to the engine (`--env-file`).
    pub env_file: Option<PathBuf>,
}

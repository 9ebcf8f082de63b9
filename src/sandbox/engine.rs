//! Container engine control surface.
//!
//! The lifecycle manager and command executor are written against the
//! [`ContainerEngine`] trait (create, start, exec, stop, remove), so the
//! default CLI-driven Docker backend can be swapped for a native client
//! or a fake engine in tests.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ContainerSpec, SandboxError};

/// How long the engine gets to create and start a container.
const CREATE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a remove (stop + rm) may take before we give up on it.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a host<->container copy may take.
const COPY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the in-container kill of a timed-out command may take.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Observed state of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    /// No container with that name exists.
    #[default]
    Missing,
    /// Exists but is not running (exited, created, paused...).
    Stopped,
    Running,
}

/// One command dispatch into a running container.
///
/// The `marker` is a unique token smuggled into the in-container shell's
/// argv (`sh -c <command> <marker>` sets it as `$0`) so a timed-out
/// command's process tree can be found and killed by pattern.
#[derive(Debug, Clone)]
pub struct ExecInvocation {
    pub command: String,
    pub working_dir: Option<String>,
    pub marker: String,
}

/// A chunk of output observed while a command runs.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Shared capture buffers for one exec call.
///
/// The engine appends incrementally, so whatever arrived before a timeout
/// or cancellation is still available to the caller afterwards.
#[derive(Clone, Default)]
pub struct OutputCapture {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    tee: Option<mpsc::UnboundedSender<OutputChunk>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally forward each chunk to `tx` as it arrives (streamed mode).
    pub fn with_tee(tx: mpsc::UnboundedSender<OutputChunk>) -> Self {
        Self {
            tee: Some(tx),
            ..Self::default()
        }
    }

    pub fn append_stdout(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        lock(&self.stdout).push_str(chunk);
        if let Some(ref tx) = self.tee {
            let _ = tx.send(OutputChunk::Stdout(chunk.to_string()));
        }
    }

    pub fn append_stderr(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        lock(&self.stderr).push_str(chunk);
        if let Some(ref tx) = self.tee {
            let _ = tx.send(OutputChunk::Stderr(chunk.to_string()));
        }
    }

    /// Current contents of both buffers.
    pub fn snapshot(&self) -> (String, String) {
        (lock(&self.stdout).clone(), lock(&self.stderr).clone())
    }
}

/// Locks a capture buffer, recovering from poisoning (a panicked pump task
/// must not make the partial output unreadable).
fn lock(buf: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    buf.lock().unwrap_or_else(|e| e.into_inner())
}

/// Client of a container engine's create/start/exec/stop/remove surface,
/// addressed by container name and image reference.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verify the engine daemon is reachable. Cheap, called before `start`.
    async fn ping(&self) -> Result<(), SandboxError>;

    /// Create and start a container per `spec`, detached, no TTY.
    /// Returns the engine's opaque container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// Observe the current state of the named container.
    async fn state(&self, name: &str) -> Result<ContainerState, SandboxError>;

    /// Run one command inside the container, appending output to `capture`
    /// as it arrives. Returns the command's exit status. The future may be
    /// dropped on timeout; `capture` outlives it.
    async fn exec(
        &self,
        name: &str,
        invocation: ExecInvocation,
        capture: OutputCapture,
    ) -> Result<i32, SandboxError>;

    /// Best-effort kill of every in-container process whose command line
    /// carries `marker`, plus its process group.
    async fn kill_marked(&self, name: &str, marker: &str) -> Result<(), SandboxError>;

    /// Stop and remove the named container. "Already gone" is success.
    async fn remove(&self, name: &str) -> Result<(), SandboxError>;

    /// Copy a host file or directory into the container.
    async fn copy_in(&self, name: &str, host: &Path, container: &str)
        -> Result<(), SandboxError>;

    /// Copy a container file or directory out to the host.
    async fn copy_out(
        &self,
        name: &str,
        container: &str,
        host: &Path,
    ) -> Result<(), SandboxError>;
}

/// Docker backend driving the `docker` CLI as a subprocess, the same way
/// the engine would be driven by hand. Any CLI with a compatible surface
/// (podman) works via `with_binary`.
pub struct DockerCli {
    bin: String,
    engine_timeout: Duration,
}

impl DockerCli {
    pub fn new(engine_timeout: Duration) -> Self {
        Self {
            bin: "docker".to_string(),
            engine_timeout,
        }
    }

    /// Use a different engine binary (e.g. "podman").
    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    /// Runs one engine CLI invocation to completion with a timeout.
    async fn output(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, String> {
        debug!(bin = %self.bin, ?args, "engine call");
        let fut = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("failed to run {}: {e}", self.bin)),
            Err(_) => Err(format!(
                "{} {} timed out after {}s",
                self.bin,
                args.first().unwrap_or(&""),
                timeout.as_secs()
            )),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<(), SandboxError> {
        let output = self
            .output(
                &["info", "--format", "{{.ServerVersion}}"],
                self.engine_timeout,
            )
            .await
            .map_err(SandboxError::EngineUnavailable)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::EngineUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
        ];

        if let Some(ref env_file) = spec.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }

        args.extend([
            "--name".to_string(),
            spec.name.clone(),
            spec.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .output(&arg_refs, CREATE_TIMEOUT)
            .await
            .map_err(SandboxError::Provision)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::Provision(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn state(&self, name: &str) -> Result<ContainerState, SandboxError> {
        let output = self
            .output(
                &["inspect", "--format", "{{.State.Running}}", name],
                self.engine_timeout,
            )
            .await
            .map_err(SandboxError::Execution)?;

        if !output.status.success() {
            // inspect fails with "No such object" when the name is unknown
            return Ok(ContainerState::Missing);
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(ContainerState::Running),
            _ => Ok(ContainerState::Stopped),
        }
    }

    async fn exec(
        &self,
        name: &str,
        invocation: ExecInvocation,
        capture: OutputCapture,
    ) -> Result<i32, SandboxError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec");
        if let Some(ref dir) = invocation.working_dir {
            cmd.args(["-w", dir]);
        }
        // The marker lands in the shell's argv as $0, visible to pgrep -f.
        cmd.args([name, "sh", "-c", &invocation.command, &invocation.marker]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Execution(format!("spawn {} exec: {e}", self.bin)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_task = tokio::spawn(pump(stdout, capture.clone(), true));
        let err_task = tokio::spawn(pump(stderr, capture.clone(), false));

        let status = child
            .wait()
            .await
            .map_err(|e| SandboxError::Execution(format!("wait on {} exec: {e}", self.bin)))?;

        // Drain both pipes fully before reporting completion.
        let _ = out_task.await;
        let _ = err_task.await;

        let Some(code) = status.code() else {
            return Err(SandboxError::Execution(format!(
                "{} exec client terminated by signal",
                self.bin
            )));
        };
        let (_, stderr) = capture.snapshot();
        if daemon_failure(code, &stderr) {
            return Err(SandboxError::Execution(stderr.trim().to_string()));
        }
        Ok(code)
    }

    async fn kill_marked(&self, name: &str, marker: &str) -> Result<(), SandboxError> {
        // Best effort: a failure here leaves at worst an orphan inside a
        // disposable container that is removed at teardown.
        let script = kill_script(marker);
        let _ = self
            .output(&["exec", name, "sh", "-c", &script], KILL_TIMEOUT)
            .await;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let output = self
            .output(&["rm", "-f", name], REMOVE_TIMEOUT)
            .await
            .map_err(SandboxError::Teardown)?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            // Already gone — exactly what we wanted.
            return Ok(());
        }
        Err(SandboxError::Teardown(stderr.trim().to_string()))
    }

    async fn copy_in(
        &self,
        name: &str,
        host: &Path,
        container: &str,
    ) -> Result<(), SandboxError> {
        let host_arg = host.display().to_string();
        let dest = format!("{name}:{container}");
        let output = self
            .output(&["cp", &host_arg, &dest], COPY_TIMEOUT)
            .await
            .map_err(SandboxError::Transfer)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Transfer(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn copy_out(
        &self,
        name: &str,
        container: &str,
        host: &Path,
    ) -> Result<(), SandboxError> {
        let src = format!("{name}:{container}");
        let host_arg = host.display().to_string();
        let output = self
            .output(&["cp", &src, &host_arg], COPY_TIMEOUT)
            .await
            .map_err(SandboxError::Transfer)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Transfer(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// `docker exec` reports its own failures (container gone, daemon error)
/// with exit code 125/126 and a daemon message on stderr, the same channel
/// an ordinary command would use. Both signs together mean the engine
/// failed, not the command.
fn daemon_failure(code: i32, stderr: &str) -> bool {
    (code == 125 || code == 126)
        && (stderr.contains("Error response from daemon")
            || stderr.contains("is not running")
            || stderr.contains("No such container"))
}

/// In-container script killing the marked shell and its process group.
/// The killer's own command line carries the marker too (it names it in
/// the pgrep pattern), so its own pid must be skipped or the loop can
/// kill itself before reaching the target.
fn kill_script(marker: &str) -> String {
    format!(
        "for p in $(pgrep -f {marker}); do \
         [ \"$p\" = \"$$\" ] && continue; \
         kill -9 -- -\"$p\" 2>/dev/null; kill -9 \"$p\" 2>/dev/null; \
         done; true"
    )
}

/// Reads one pipe to EOF, appending chunks to the capture as they arrive.
async fn pump<R>(reader: Option<R>, capture: OutputCapture, is_stdout: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                if is_stdout {
                    capture.append_stdout(&chunk);
                } else {
                    capture.append_stderr(&chunk);
                }
            }
        }
    }
}

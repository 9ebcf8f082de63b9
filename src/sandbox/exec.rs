//! Command execution inside the running environment.
//!
//! One `run` call owns the container's foreground attention for its whole
//! duration; calls against the same sandbox are strictly serialized. An
//! ordinary command failure (non-zero exit) is data in the result, never
//! an error — only engine-level trouble surfaces as `SandboxError`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::{ExecInvocation, OutputCapture, OutputChunk};
use super::manager::SandboxManager;
use super::SandboxError;

/// Exit status reported when a command was killed by timeout or
/// cancellation. Distinct from every real 0–255 process exit code.
pub const TIMEOUT_EXIT_STATUS: i32 = -1;

/// After killing a timed-out command, how long the exec call gets to
/// observe the death and drain its pipes before being abandoned.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One command to execute inside the environment.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Command text, run through the container's `sh -c`.
    pub command: String,
    /// Working directory inside the environment.
    pub working_dir: Option<String>,
    /// Per-call timeout; falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Stream output chunks incrementally instead of only returning the
    /// complete result.
    pub stream: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout: None,
            stream: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Structured outcome of one command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub duration: Duration,
    /// True when the call was terminated by timeout rather than completing.
    pub timed_out: bool,
    /// True when the call was aborted by an interrupt.
    pub cancelled: bool,
}

/// Runs commands inside the managed sandbox, enforcing timeouts and
/// capturing structured output.
pub struct CommandExecutor {
    manager: Arc<SandboxManager>,
    stream_sink: Option<mpsc::UnboundedSender<OutputChunk>>,
}

impl CommandExecutor {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            stream_sink: None,
        }
    }

    /// Forward output chunks of streamed requests to `tx` as they arrive.
    pub fn with_stream_sink(mut self, tx: mpsc::UnboundedSender<OutputChunk>) -> Self {
        self.stream_sink = Some(tx);
        self
    }

    /// Runs one command to completion, timeout, or cancellation.
    ///
    /// An engine-level failure (environment not running, daemon gone) is
    /// recovered once via `ensure_running` and a single retry; it surfaces
    /// only if recovery also fails. Timeouts and non-zero exits come back
    /// as result data.
    pub async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, SandboxError> {
        let _foreground = self.manager.exec_lock().lock().await;
        let timeout = request
            .timeout
            .unwrap_or(self.manager.config().command_timeout);

        match self.dispatch(request, timeout, cancel).await {
            Err(SandboxError::Execution(reason)) => {
                warn!("command dispatch failed ({reason}), recreating sandbox and retrying once");
                self.manager.ensure_running().await?;
                self.dispatch(request, timeout, cancel).await
            }
            other => other,
        }
    }

    async fn dispatch(
        &self,
        request: &CommandRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, SandboxError> {
        let start = Instant::now();
        let marker = format!("hermit-run-{}", Uuid::new_v4().simple());

        let capture = match (&self.stream_sink, request.stream) {
            (Some(tx), true) => OutputCapture::with_tee(tx.clone()),
            _ => OutputCapture::new(),
        };

        let invocation = ExecInvocation {
            command: request.command.clone(),
            working_dir: request.working_dir.clone(),
            marker: marker.clone(),
        };
        debug!(command = %request.command, timeout_secs = timeout.as_secs(), "dispatch");

        let engine = Arc::clone(self.manager.engine());
        let name = self.manager.container_name().to_string();
        let exec_capture = capture.clone();
        // Spawned so the capture and wait survive a timeout of this future.
        let mut exec = tokio::spawn(async move {
            engine.exec(&name, invocation, exec_capture).await
        });

        let outcome = tokio::select! {
            joined = &mut exec => Some(flatten(joined)?),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => {
                let (stdout, stderr) = self.abort_marked(&marker, &mut exec, &capture).await;
                return Ok(CommandResult {
                    stdout,
                    stderr,
                    exit_status: TIMEOUT_EXIT_STATUS,
                    duration: start.elapsed(),
                    timed_out: false,
                    cancelled: true,
                });
            }
        };

        match outcome {
            Some(exit_status) => {
                let (stdout, stderr) = capture.snapshot();
                Ok(CommandResult {
                    stdout,
                    stderr,
                    exit_status,
                    duration: start.elapsed(),
                    timed_out: false,
                    cancelled: false,
                })
            }
            None => {
                warn!(
                    command = %request.command,
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing its process tree"
                );
                let (stdout, stderr) = self.abort_marked(&marker, &mut exec, &capture).await;
                Ok(CommandResult {
                    stdout,
                    stderr,
                    exit_status: TIMEOUT_EXIT_STATUS,
                    duration: start.elapsed(),
                    timed_out: true,
                    cancelled: false,
                })
            }
        }
    }

    /// Kills the marked in-container process tree, lets the exec call drain
    /// briefly, and returns whatever output was captured up to the cutoff.
    async fn abort_marked(
        &self,
        marker: &str,
        exec: &mut tokio::task::JoinHandle<Result<i32, SandboxError>>,
        capture: &OutputCapture,
    ) -> (String, String) {
        let _ = self
            .manager
            .engine()
            .kill_marked(self.manager.container_name(), marker)
            .await;
        if tokio::time::timeout(KILL_GRACE, &mut *exec).await.is_err() {
            exec.abort();
        }
        capture.snapshot()
    }
}

fn flatten(
    joined: Result<Result<i32, SandboxError>, tokio::task::JoinError>,
) -> Result<i32, SandboxError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(SandboxError::Execution(format!("exec task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::{test_config, FakeEngine, FakeExec};
    use crate::sandbox::ContainerEngine;

    fn executor_with(engine: Arc<FakeEngine>) -> (Arc<SandboxManager>, CommandExecutor) {
        let manager = Arc::new(SandboxManager::new(engine, test_config()));
        let executor = CommandExecutor::new(Arc::clone(&manager));
        (manager, executor)
    }

    async fn started(engine: &Arc<FakeEngine>) -> (Arc<SandboxManager>, CommandExecutor) {
        let (manager, executor) = executor_with(Arc::clone(engine));
        manager.start().await.unwrap();
        (manager, executor)
    }

    // ── Normal completion ────────────────────────────────

    #[tokio::test]
    async fn test_run_captures_output_and_status() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            stdout: "hi\n".into(),
            ..Default::default()
        });

        let result = executor
            .run(&CommandRequest::new("echo hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_status, 0);
        assert!(!result.timed_out);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data_not_error() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            stderr: "boom\n".into(),
            status: 3,
            ..Default::default()
        });

        let result = executor
            .run(&CommandRequest::new("false"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.stderr, "boom\n");
        // Not retried: exactly one exec reached the engine
        assert_eq!(exec_count(&engine), 1);
    }

    // ── Timeout ──────────────────────────────────────────

    #[tokio::test]
    async fn test_timeout_returns_partial_output_and_sentinel() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            stdout: "partial".into(),
            delay: Duration::from_secs(30),
            ..Default::default()
        });

        let request = CommandRequest::new("sleep 60").with_timeout(Duration::from_millis(50));
        let result = executor
            .run(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_status, TIMEOUT_EXIT_STATUS);
        assert_eq!(result.stdout, "partial", "pre-cutoff output must survive");
        assert!(engine
            .call_log()
            .iter()
            .any(|c| c.starts_with("kill:")), "process tree must be killed");
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_config_default() {
        let engine = Arc::new(FakeEngine::up());
        let mut config = test_config();
        config.command_timeout = Duration::from_millis(50);
        let manager = Arc::new(SandboxManager::new(
            Arc::clone(&engine) as Arc<dyn ContainerEngine>,
            config,
        ));
        let executor = CommandExecutor::new(Arc::clone(&manager));
        manager.start().await.unwrap();

        engine.push_exec(FakeExec {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let result = executor
            .run(&CommandRequest::new("sleep 60"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.timed_out);
    }

    // ── Cancellation ─────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_aborts_command_but_not_sandbox() {
        let engine = Arc::new(FakeEngine::up());
        let (manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            delay: Duration::from_secs(30),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            aborter.cancel();
        });

        let result = executor
            .run(&CommandRequest::new("sleep 60"), &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert_eq!(result.exit_status, TIMEOUT_EXIT_STATUS);
        // The environment itself stays up
        assert_eq!(
            manager.status().await,
            Some(crate::sandbox::SandboxStatus::Running)
        );
    }

    // ── Self-healing ─────────────────────────────────────

    #[tokio::test]
    async fn test_engine_failure_recovers_once_then_succeeds() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            fail: true,
            ..Default::default()
        });
        engine.push_exec(FakeExec {
            stdout: "recovered\n".into(),
            ..Default::default()
        });

        let result = executor
            .run(&CommandRequest::new("echo recovered"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "recovered\n");
        assert_eq!(exec_count(&engine), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_after_failed_recovery() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            fail: true,
            ..Default::default()
        });
        engine.push_exec(FakeExec {
            fail: true,
            ..Default::default()
        });

        let err = executor
            .run(&CommandRequest::new("true"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }

    // ── Ordering ─────────────────────────────────────────

    #[tokio::test]
    async fn test_back_to_back_runs_never_interleave() {
        let engine = Arc::new(FakeEngine::up());
        let (_manager, executor) = started(&engine).await;
        engine.push_exec(FakeExec {
            stdout: "one".into(),
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        engine.push_exec(FakeExec {
            stdout: "two".into(),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let first_request = CommandRequest::new("first");
        let second_request = CommandRequest::new("second");
        let (first, second) = tokio::join!(
            executor.run(&first_request, &cancel),
            executor.run(&second_request, &cancel),
        );

        // Each result holds exactly one command's output
        assert_eq!(first.unwrap().stdout, "one");
        assert_eq!(second.unwrap().stdout, "two");

        // The second exec only reached the engine after the first finished
        let log = engine.call_log();
        let first_pos = log.iter().position(|c| c.contains("exec:") && c.contains("first"));
        let second_pos = log.iter().position(|c| c.contains("exec:") && c.contains("second"));
        assert!(first_pos.unwrap() < second_pos.unwrap());
    }

    fn exec_count(engine: &FakeEngine) -> usize {
        engine
            .call_log()
            .iter()
            .filter(|c| c.starts_with("exec:"))
            .count()
    }
}

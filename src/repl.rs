//! Interactive session driving the sandbox.
//!
//! Plain input is executed inside the environment; `/`-prefixed input is a
//! session command. Ctrl-C while a command runs aborts that command only;
//! Ctrl-C at the prompt ends the session.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sandbox::{
    CommandExecutor, CommandRequest, CommandResult, FileGateway, OutputChunk, SandboxManager,
    SandboxStatus,
};

const PROMPT: &str = "hermit> ";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Empty,
    Help,
    Status,
    Put { host: String, container: String },
    Get { container: String, host: String },
    Exit,
    Unknown(String),
    Run(String),
}

fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    if !line.starts_with('/') {
        return ReplCommand::Run(line.to_string());
    }

    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    match verb {
        "/help" => ReplCommand::Help,
        "/status" => ReplCommand::Status,
        "/exit" | "/quit" => ReplCommand::Exit,
        "/put" => match (parts.next(), parts.next()) {
            (Some(host), Some(container)) => ReplCommand::Put {
                host: host.to_string(),
                container: container.to_string(),
            },
            _ => ReplCommand::Unknown("/put needs HOST_PATH CONTAINER_PATH".to_string()),
        },
        "/get" => match (parts.next(), parts.next()) {
            (Some(container), Some(host)) => ReplCommand::Get {
                container: container.to_string(),
                host: host.to_string(),
            },
            _ => ReplCommand::Unknown("/get needs CONTAINER_PATH HOST_PATH".to_string()),
        },
        other => ReplCommand::Unknown(format!("unknown command {other} (try /help)")),
    }
}

fn print_repl_help() {
    println!(
        "\
Commands:
    /status                      Show sandbox status
    /put HOST_PATH CONTAINER    Copy a host file or directory into the sandbox
    /get CONTAINER HOST_PATH    Copy a file or directory out of the sandbox
    /help                        Show this message
    /exit                        End the session (tears the sandbox down)

Anything else is run as a shell command inside the sandbox."
    );
}

pub struct Repl {
    manager: Arc<SandboxManager>,
    executor: CommandExecutor,
    gateway: FileGateway,
    chunks: mpsc::UnboundedReceiver<OutputChunk>,
}

impl Repl {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor: CommandExecutor::new(Arc::clone(&manager)).with_stream_sink(tx),
            gateway: FileGateway::new(Arc::clone(&manager)),
            manager,
            chunks: rx,
        }
    }

    /// Runs the session loop until `/exit`, EOF, or Ctrl-C at the prompt.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type a command to run it in the sandbox, /help for commands.");

        loop {
            print!("{PROMPT}");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    info!("interrupt at prompt, ending session");
                    return Ok(());
                }
            };
            let Some(line) = line else {
                // EOF (piped input exhausted, or Ctrl-D)
                return Ok(());
            };

            match parse_line(&line) {
                ReplCommand::Empty => {}
                ReplCommand::Help => print_repl_help(),
                ReplCommand::Status => {
                    let _ = interruptible(self.print_status()).await;
                }
                ReplCommand::Exit => return Ok(()),
                ReplCommand::Unknown(msg) => println!("{msg}"),
                ReplCommand::Put { host, container } => {
                    let put = self.gateway.put(Path::new(&host), &container);
                    if let Some(Err(e)) = interruptible(put).await {
                        println!("put failed: {e}");
                    }
                }
                ReplCommand::Get { container, host } => {
                    let get = self.gateway.get(&container, Path::new(&host));
                    if let Some(Err(e)) = interruptible(get).await {
                        println!("get failed: {e}");
                    }
                }
                ReplCommand::Run(command) => self.run_command(&command).await,
            }
        }
    }

    /// Executes one command, printing output as it arrives. Ctrl-C here
    /// aborts the command; the session and the sandbox stay up.
    async fn run_command(&mut self, command: &str) {
        let request = CommandRequest::new(command).streamed();
        let cancel = CancellationToken::new();
        let run = self.executor.run(&request, &cancel);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(chunk) = self.chunks.recv() => print_chunk(&chunk),
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    info!("interrupt, aborting current command");
                    cancel.cancel();
                }
            }
        };

        // Chunks that raced with completion
        while let Ok(chunk) = self.chunks.try_recv() {
            print_chunk(&chunk);
        }

        match result {
            Ok(result) => print_outcome(&result),
            Err(e) => println!("command failed: {e}"),
        }
    }

    async fn print_status(&self) {
        let config = self.manager.config();
        let status = match self.manager.status().await {
            Some(SandboxStatus::Provisioning) => "provisioning",
            Some(SandboxStatus::Running) => "running",
            Some(SandboxStatus::Stopping) => "stopping",
            Some(SandboxStatus::Stopped) => "stopped",
            None => "not started",
        };
        println!("container : {} ({status})", config.container_name);
        println!("image     : {}", config.image);
        if config.mounts.is_empty() {
            println!("mounts    : none");
        } else {
            for mount in &config.mounts {
                println!("mount     : {}", mount.volume_arg());
            }
        }
        if let Some(started_at) = self.manager.started_at().await {
            let uptime = chrono::Utc::now().signed_duration_since(started_at);
            println!("uptime    : {}s", uptime.num_seconds().max(0));
        }
    }
}

/// Awaits a session operation while keeping Ctrl-C observable. On
/// interrupt the wait is abandoned and None returned; the underlying
/// engine call still runs under its own timeout.
async fn interruptible<T>(operation: impl std::future::Future<Output = T>) -> Option<T> {
    tokio::select! {
        out = operation => Some(out),
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("interrupt, abandoning the current operation");
            None
        }
    }
}

fn print_chunk(chunk: &OutputChunk) {
    match chunk {
        OutputChunk::Stdout(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        OutputChunk::Stderr(text) => eprint!("{text}"),
    }
}

fn print_outcome(result: &CommandResult) {
    if result.timed_out {
        println!("[timed out after {}s, process tree killed]", result.duration.as_secs());
    } else if result.cancelled {
        println!("[interrupted]");
    } else if result.exit_status != 0 {
        println!("[exit status {}]", result.exit_status);
    }
}

mod config;
mod repl;
mod sandbox;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::repl::Repl;
use crate::sandbox::{envfile, mounts};
use crate::sandbox::{
    AccessMode, CleanupRegistrar, DockerCli, MountDecl, SandboxConfig, SandboxError,
    SandboxManager, MNT_MOUNT_POINT, SKILLS_MOUNT_POINT,
};

/// Exit code when the container engine daemon is unreachable at startup.
const EXIT_ENGINE_UNAVAILABLE: i32 = 2;
/// Exit code when the sandbox could not be provisioned.
const EXIT_PROVISION_FAILED: i32 = 3;

fn print_help() {
    println!(
        "\
hermit-agent v{}

An agent CLI that runs every command inside a disposable container sandbox.

USAGE:
    hermit-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/agent.toml]

OPTIONS:
    --mnt-dir DIR       Host directory mounted read-write at /mnt [default: .]
    --no-mnt            Run without any host mounts
    --skills-dir DIR    Host directory mounted read-only at /skills
    --image IMAGE       Container image for the sandbox
    -h, --help          Print this help message and exit
    -V, --version       Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                   Log level filter for tracing
                               (e.g. debug, hermit_agent=debug,warn)
    SANDBOX_CONTAINER_IMAGE    Default sandbox image when not configured
    SANDBOX_CONTAINER_NAME     Container name prefix when not configured

EXAMPLES:
    hermit-agent                            # uses config/agent.toml
    hermit-agent --mnt-dir ~/project        # mount a project at /mnt
    hermit-agent --no-mnt                   # fully isolated sandbox
    RUST_LOG=debug hermit-agent             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Command-line overrides, applied on top of the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: Option<String>,
    mnt_dir: Option<String>,
    no_mnt: bool,
    skills_dir: Option<String>,
    image: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mnt-dir" => {
                parsed.mnt_dir = Some(args.next().ok_or("--mnt-dir needs a directory")?);
            }
            "--no-mnt" => parsed.no_mnt = true,
            "--skills-dir" => {
                parsed.skills_dir = Some(args.next().ok_or("--skills-dir needs a directory")?);
            }
            "--image" => {
                parsed.image = Some(args.next().ok_or("--image needs an image reference")?);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option {flag} (see --help)"));
            }
            _ => {
                if parsed.config_path.is_some() {
                    return Err(format!("unexpected argument {arg}"));
                }
                parsed.config_path = Some(arg);
            }
        }
    }
    Ok(parsed)
}

/// Builds the immutable sandbox configuration from the config file and
/// CLI overrides: resolved mounts, merged environment, derived name.
fn build_sandbox_config(config: &Config, args: &CliArgs) -> SandboxConfig {
    let section = &config.sandbox;
    let mnt_dir = args.mnt_dir.as_deref().unwrap_or(&section.mnt_dir);
    let skills_dir = args.skills_dir.as_deref().unwrap_or(&section.skills_dir);
    let no_mnt = args.no_mnt || section.no_mnt;

    let declared = [
        MountDecl::new(mnt_dir, MNT_MOUNT_POINT, AccessMode::ReadWrite),
        MountDecl::new(skills_dir, SKILLS_MOUNT_POINT, AccessMode::ReadOnly),
    ];
    let mounts = mounts::resolve(&declared, no_mnt);

    let env_file = shellexpand::tilde(&section.env_file).into_owned();
    let env = envfile::merge(
        envfile::load(std::path::Path::new(&env_file)),
        &section.env,
    );

    SandboxConfig {
        image: args.image.clone().unwrap_or_else(|| section.image.clone()),
        container_name: SandboxConfig::container_name_for(&section.container_prefix),
        mounts,
        env,
        command_timeout: section.command_timeout(),
        engine_timeout: section.engine_timeout(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("hermit-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hermit_agent=info")),
        )
        .init();

    println!(
        r#"
   _   _                     _ _
  | | | | ___ _ __ _ __ ___ (_) |_
  | |_| |/ _ \ '__| '_ ` _ \| | __|
  |  _  |  __/ |  | | | | | | | |_
  |_| |_|\___|_|  |_| |_| |_|_|\__|
                             v{}
"#,
        env!("CARGO_PKG_VERSION")
    );

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    // Load configuration
    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| "config/agent.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let sandbox_config = build_sandbox_config(&config, &args);
    info!("Agent: {}", config.agent.name);
    info!("Sandbox image: {}", sandbox_config.image);
    info!("Container: {}", sandbox_config.container_name);
    if sandbox_config.mounts.is_empty() {
        info!("Mounts: none");
    } else {
        for mount in &sandbox_config.mounts {
            info!("Mount: {}", mount.volume_arg());
        }
    }

    let engine = Arc::new(DockerCli::new(sandbox_config.engine_timeout));
    let manager = Arc::new(SandboxManager::new(engine, sandbox_config));

    // Provisioning is the only phase allowed to abort the program.
    if let Err(e) = manager.start().await {
        error!("{e}");
        let code = match e {
            SandboxError::EngineUnavailable(_) => EXIT_ENGINE_UNAVAILABLE,
            SandboxError::Provision(_) => EXIT_PROVISION_FAILED,
            _ => 1,
        };
        std::process::exit(code);
    }

    let registrar = CleanupRegistrar::arm(Arc::clone(&manager));
    let mut repl = Repl::new(Arc::clone(&manager));

    #[cfg(unix)]
    let result = {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = repl.run() => result,
            _ = sigterm.recv() => {
                info!("SIGTERM received, ending session");
                Ok(())
            }
        }
    };
    #[cfg(not(unix))]
    let result = repl.run().await;

    registrar.teardown().await;
    result
}

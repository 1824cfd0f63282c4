//! tauctr - container execution CLI
//!
//! Runs containers on whichever engine is available, Docker or containerd,
//! and manages the per-user rootless containerd daemon.
//!
//! ## Usage
//!
//! ```sh
//! tauctr run alpine:3.19 -- echo hello
//! tauctr run alpine:3.19 --backend containerd -- sh -c 'exit 3'
//! tauctr pull nginx:1.25
//! tauctr health
//! tauctr daemon start|stop|status
//! tauctr check-mount /srv/data /data
//! ```
//!
//! ## Backend Selection
//!
//! `--config <file.json>` wins, then `--backend <docker|containerd>` with
//! default settings, then automatic selection (Docker first, then
//! containerd). Log verbosity follows `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use tauctr::{
    select_backend, Backend, BackendConfig, BackendRegistry, BackendType, ContainerConfig,
    ContainerdConfig, Daemon, Identity, RootlessTools, SubIdValidator,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

/// Flags shared by the backend-facing commands.
#[derive(Debug, Default)]
struct BackendArgs {
    backend: Option<BackendType>,
    config: Option<PathBuf>,
}

#[derive(Debug)]
enum Command {
    Run {
        image: String,
        command: Vec<String>,
        backend: BackendArgs,
    },
    Pull {
        image: String,
        backend: BackendArgs,
    },
    Health {
        backend: BackendArgs,
    },
    Daemon {
        action: DaemonAction,
        config: Option<PathBuf>,
    },
    CheckMount {
        host_path: PathBuf,
        container_path: String,
        config: Option<PathBuf>,
    },
    Version,
    Help,
}

#[derive(Debug, Clone, Copy)]
enum DaemonAction {
    Start,
    Stop,
    Status,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Help);
    };

    // Everything after `--` is the container argv.
    let rest = args.get(2..).unwrap_or_default();
    let (flags, trailing) = match rest.iter().position(|a| a == "--") {
        Some(i) => (&rest[..i], rest[i + 1..].to_vec()),
        None => (rest, Vec::new()),
    };
    let (positional, backend) = parse_flags(flags)?;

    match command.as_str() {
        "run" => {
            let [image, rest @ ..] = positional.as_slice() else {
                return Err("run requires <image>".to_string());
            };
            let mut command = rest.to_vec();
            command.extend(trailing);
            Ok(Command::Run {
                image: image.clone(),
                command,
                backend,
            })
        }
        "pull" => match positional.as_slice() {
            [image] => Ok(Command::Pull {
                image: image.clone(),
                backend,
            }),
            _ => Err("pull requires <image>".to_string()),
        },
        "health" => Ok(Command::Health { backend }),
        "daemon" => {
            let action = match positional.first().map(String::as_str) {
                Some("start") => DaemonAction::Start,
                Some("stop") => DaemonAction::Stop,
                Some("status") | None => DaemonAction::Status,
                Some(other) => return Err(format!("unknown daemon action: {}", other)),
            };
            Ok(Command::Daemon {
                action,
                config: backend.config,
            })
        }
        "check-mount" => match positional.as_slice() {
            [host, container] => Ok(Command::CheckMount {
                host_path: PathBuf::from(host),
                container_path: container.clone(),
                config: backend.config,
            }),
            _ => Err("check-mount requires <host-path> <container-path>".to_string()),
        },
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

fn parse_flags(args: &[String]) -> Result<(Vec<String>, BackendArgs), String> {
    let mut positional = Vec::new();
    let mut backend = BackendArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" | "-b" => {
                let value = args.get(i + 1).ok_or("--backend requires a value")?;
                backend.backend = Some(value.parse().map_err(|e| format!("{e}"))?);
                i += 2;
            }
            "--config" | "-c" => {
                let value = args.get(i + 1).ok_or("--config requires a path")?;
                backend.config = Some(PathBuf::from(value));
                i += 2;
            }
            flag if flag.starts_with('-') && positional.is_empty() => {
                return Err(format!("unknown flag: {}", flag));
            }
            arg => {
                positional.push(arg.to_string());
                i += 1;
            }
        }
    }
    Ok((positional, backend))
}

// =============================================================================
// Backend Setup
// =============================================================================

fn load_config(path: &Path) -> anyhow::Result<BackendConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    BackendConfig::from_json(&json).with_context(|| format!("invalid config {}", path.display()))
}

fn containerd_config(path: Option<&Path>) -> anyhow::Result<ContainerdConfig> {
    match path {
        None => Ok(ContainerdConfig::default()),
        Some(path) => match load_config(path)? {
            BackendConfig::Containerd(config) => Ok(config),
            BackendConfig::Docker(_) => bail!("{} is a docker config", path.display()),
        },
    }
}

async fn open_backend(args: &BackendArgs) -> anyhow::Result<Arc<dyn Backend>> {
    let registry = BackendRegistry::with_defaults();

    let backend = match (&args.config, args.backend) {
        (Some(path), _) => registry.create(load_config(path)?).await?,
        (None, Some(backend)) => {
            registry
                .create(BackendConfig::default_for(backend))
                .await?
        }
        (None, None) => select_backend(&registry).await?,
    };
    debug!("Using {} backend", backend.backend_type());
    Ok(backend)
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_run(image: String, command: Vec<String>, args: BackendArgs) -> anyhow::Result<u8> {
    let backend = open_backend(&args).await?;

    let handle = backend.image(&image);
    if !handle.exists().await {
        handle.pull().await?;
    }

    let config = ContainerConfig::new(image).with_command(command);
    let id = backend.create(&config).await?;

    let outcome = async {
        backend.start(&id).await?;
        if let Err(e) = backend.wait(&id).await {
            if e.exit_code().is_none() {
                return Err(e.into());
            }
        }

        let mut logs = backend.logs(&id).await?;
        tokio::io::copy(&mut logs, &mut tokio::io::stdout()).await?;

        let info = backend.inspect(&id).await?;
        anyhow::Ok(info.exit_code)
    }
    .await;

    if let Err(e) = backend.remove(&id).await {
        warn!("Failed to remove {}: {}", id, e);
    }

    let code = outcome?;
    Ok(u8::try_from(code).unwrap_or(1))
}

async fn cmd_pull(image: String, args: BackendArgs) -> anyhow::Result<()> {
    let backend = open_backend(&args).await?;
    backend.image(&image).pull().await?;
    println!("{}", image);
    Ok(())
}

async fn cmd_health(args: BackendArgs) -> anyhow::Result<()> {
    let backend = open_backend(&args).await?;
    backend.health_check().await?;
    let caps = backend.capabilities();
    println!("backend: {}", backend.backend_type());
    println!("healthy: true");
    println!("build: {}", caps.supports_build);
    Ok(())
}

async fn cmd_daemon(action: DaemonAction, config: Option<PathBuf>) -> anyhow::Result<()> {
    let daemon = Daemon::new(containerd_config(config.as_deref())?)?;

    match action {
        DaemonAction::Start => {
            daemon.start().await?;
            println!("containerd running at {}", daemon.socket_path().display());
        }
        DaemonAction::Stop => {
            daemon.stop().await?;
            println!("containerd stopped");
        }
        DaemonAction::Status => {
            let running = daemon.is_running().await;
            println!("socket: {}", daemon.socket_path().display());
            println!("rootless: {}", daemon.is_rootless());
            println!("running: {}", running);
            if !running {
                bail!(tauctr::Error::DaemonNotRunning);
            }
        }
    }
    Ok(())
}

fn cmd_check_mount(
    host_path: &Path,
    container_path: &str,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = containerd_config(config.as_deref())?;
    let validator = SubIdValidator::new(Identity::current()?, RootlessTools::detect(&config));
    validator.validate_mount_permissions(host_path, container_path)?;
    println!("{} can be mounted at {}", host_path.display(), container_path);
    Ok(())
}

fn cmd_version() {
    println!("tauctr version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"tauctr - run containers on Docker or (rootless) containerd

USAGE:
    tauctr <command> [options]

COMMANDS:
    run <image> [-- <cmd>...]          Create, start, wait, print logs, remove
    pull <image>                       Pull an image
    health                             Check the selected backend
    daemon start|stop|status           Manage the rootless containerd daemon
    check-mount <host> <container>     Check a bind mount against subuid/subgid
    version                            Show version info
    help                               Show this help

OPTIONS:
    --backend, -b <docker|containerd>  Use this backend with default settings
    --config, -c <file.json>           Backend config, e.g. {{"containerd": {{"namespace": "ci"}}}}

ENVIRONMENT:
    RUST_LOG       Log filter (default: info)
    DOCKER_HOST    Docker engine address
"#
    );
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Run {
            image,
            command,
            backend,
        } => cmd_run(image, command, backend).await.map(ExitCode::from),
        Command::Pull { image, backend } => cmd_pull(image, backend).await.map(|()| ExitCode::SUCCESS),
        Command::Health { backend } => cmd_health(backend).await.map(|()| ExitCode::SUCCESS),
        Command::Daemon { action, config } => {
            cmd_daemon(action, config).await.map(|()| ExitCode::SUCCESS)
        }
        Command::CheckMount {
            host_path,
            container_path,
            config,
        } => cmd_check_mount(&host_path, &container_path, config).map(|()| ExitCode::SUCCESS),
        Command::Version => {
            cmd_version();
            Ok(ExitCode::SUCCESS)
        }
        Command::Help => {
            cmd_help();
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("tauctr")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cmd = parse_args(&argv(&["run", "alpine", "--backend", "docker", "--", "ls", "-l"]))
            .unwrap();
        match cmd {
            Command::Run {
                image,
                command,
                backend,
            } => {
                assert_eq!(image, "alpine");
                assert_eq!(command, vec!["ls", "-l"]);
                assert_eq!(backend.backend, Some(BackendType::Docker));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&argv(&["run"])).is_err());
        assert!(parse_args(&argv(&["pull", "alpine", "--backend", "lxc"])).is_err());
        assert!(parse_args(&argv(&["daemon", "restart"])).is_err());
        assert!(parse_args(&argv(&["check-mount", "/srv"])).is_err());
        assert!(matches!(parse_args(&argv(&[])), Ok(Command::Help)));
    }
}

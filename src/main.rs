mod access;
mod backend;
mod commands;
mod config;
mod daemon;
mod git;
mod health;
mod hooks;
mod http;
mod keys;
mod lifecycle;
mod metrics;
mod pktline;
mod render;
mod ssh;
mod stats;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::access::AccessControl;
use crate::backend::{Backend, FsBackend};
use crate::commands::CommandRouter;
use crate::config::{Config, LogFormat};
use crate::daemon::GitDaemonListener;
use crate::hooks::dispatch::{HookContext, HookDispatcher};
use crate::hooks::provision::HookProvisioner;
use crate::hooks::HookName;
use crate::http::HttpListener;
use crate::lifecycle::{Listener, Server};
use crate::metrics::MetricsRegistry;
use crate::ssh::SshListener;
use crate::stats::StatsListener;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "githarbor", about = "Self-hosted git server", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "GITHARBOR_CONFIG",
        default_value = "githarbor/config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ssh, git, http and stats listeners.
    Serve {
        /// Rewrite the hook scripts of every repository before serving.
        #[arg(long)]
        init_hooks: bool,
    },
    /// Entry points for scripts generated by the server.
    #[command(subcommand, hide = true)]
    Internal(Internal),
}

#[derive(Subcommand, Debug)]
enum Internal {
    /// Run a git hook.  Invoked by the scripts in each repository's hooks/.
    Hook {
        hook: HookName,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every listener and session.
pub struct AppState {
    pub config: Arc<Config>,
    /// Absolute path of the loaded config, exported to git children so
    /// hooks can find it.
    pub config_path: PathBuf,
    pub access: Arc<AccessControl>,
    pub backend: Arc<FsBackend>,
    pub router: CommandRouter,
    pub provisioner: HookProvisioner,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf, provisioner: HookProvisioner) -> Result<Self> {
        let access = Arc::new(AccessControl::open(&config).context("failed to open access control")?);
        let backend = Arc::new(FsBackend::new(config.repo_path()));
        let router = CommandRouter::new(
            config.name.clone(),
            Arc::clone(&access),
            Arc::clone(&backend) as Arc<dyn Backend>,
        );
        Ok(Self {
            config: Arc::new(config),
            config_path,
            access,
            backend,
            router,
            provisioner,
            metrics: MetricsRegistry::new(),
        })
    }

    #[cfg(test)]
    pub fn for_test(data: &Path) -> Arc<Self> {
        let config = access::tests::test_config(data);
        let provisioner = HookProvisioner::new("/usr/local/bin/githarbor", config.name.clone());
        Arc::new(Self::new(config, data.join("config.yaml"), provisioner).unwrap())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_server_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Hook processes share stderr with the pushing client, so they log to a
/// file instead.  If the file cannot be opened the hook runs unlogged.
fn init_hook_tracing(config: &Config) {
    let path = config.hook_log_path();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let writer = Mutex::new(file);
    let registry = tracing_subscriber::registry().with(env_filter());
    match config.log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init(),
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

async fn serve(config_path: &Path, init_hooks: bool) -> Result<()> {
    let config = config::load_or_init_config(config_path)?;
    init_server_tracing(config.log.format);
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("failed to resolve {}", config_path.display()))?;
    tracing::info!(config_path = %config_path.display(), name = %config.name, "starting githarbor");

    let repo_root = config.repo_path();
    tokio::fs::create_dir_all(&repo_root)
        .await
        .with_context(|| format!("failed to create {}", repo_root.display()))?;

    let host_key = keys::load_or_create_host_key(&config.ssh.key_path)?;

    let provisioner = HookProvisioner::for_current_exe(config.name.clone())?;
    if init_hooks {
        let count = provisioner.provision(&repo_root)?;
        tracing::info!(repos = count, "hooks provisioned");
    }

    let shutdown_timeout = config.shutdown_timeout();
    let state = Arc::new(AppState::new(config, config_path, provisioner)?);

    let listeners: Vec<Arc<dyn Listener>> = vec![
        Arc::new(SshListener::new(Arc::clone(&state), host_key)),
        Arc::new(GitDaemonListener::new(Arc::clone(&state))),
        Arc::new(HttpListener::new(Arc::clone(&state))),
        Arc::new(StatsListener::new(Arc::clone(&state))),
    ];
    let server = Server::new(listeners, shutdown_timeout, state.metrics.clone());
    server.run(shutdown_signal()).await?;

    tracing::info!("githarbor shut down cleanly");
    Ok(())
}

/// Runs one git hook and returns its exit code.
fn run_hook(config_path: &Path, hook: HookName, args: &[String]) -> Result<i32> {
    let config = config::load_config(config_path)?;
    init_hook_tracing(&config);

    let ctx = HookContext::from_env()?;
    let dispatcher = HookDispatcher::new(AccessControl::open(&config)?);

    let stdin = std::io::stdin();
    let mut stderr = std::io::stderr();
    Ok(dispatcher.run(hook, args, &ctx, stdin.lock(), &mut stderr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { init_hooks } => serve(&cli.config, init_hooks).await,
        Command::Internal(Internal::Hook { hook, args }) => {
            let code = run_hook(&cli.config, hook, &args)?;
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hook_invocation() {
        let cli = Cli::try_parse_from([
            "githarbor",
            "--config",
            "/srv/githarbor/config.yaml",
            "internal",
            "hook",
            "update",
            "refs/heads/main",
            "0000000000000000000000000000000000000000",
            "1111111111111111111111111111111111111111",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/srv/githarbor/config.yaml"));
        match cli.command {
            Command::Internal(Internal::Hook { hook, args }) => {
                assert_eq!(hook, HookName::Update);
                assert_eq!(args.len(), 3);
                assert_eq!(args[0], "refs/heads/main");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from(["githarbor", "serve", "--init-hooks"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { init_hooks: true }));
    }

    #[test]
    fn rejects_unknown_hook() {
        assert!(Cli::try_parse_from(["githarbor", "internal", "hook", "pre-commit"]).is_err());
    }

    #[test]
    fn state_wires_router_to_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::for_test(tmp.path());
        assert_eq!(state.backend.repo_path("widgets"), tmp.path().join("repos/widgets.git"));
        assert!(state.config_path.ends_with("config.yaml"));
    }
}

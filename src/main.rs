#![forbid(unsafe_code)]

//! `agent-conduit`: background agent daemon binary.
//!
//! Loads configuration, binds the control socket, and runs the mailbox
//! poller, stream watchdog, and heartbeat until a signal or a `shutdown`
//! command arrives.

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::daemon::Daemon;
use agent_conduit::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Background agent control daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the root directory (socket, mailbox, logs).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-conduit bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config(&args)?;
    info!(root = %config.root.display(), "configuration loaded");

    let daemon = Daemon::launch(config).await?;
    let ct = daemon.state().shutdown.clone();

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            daemon.shutdown();
        }
        () = ct.cancelled() => {}
    }

    daemon.join().await;
    info!("agent-conduit shut down");
    Ok(())
}

fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let root = match args.root {
        Some(ref root) => Some(absolute(root)?),
        None => None,
    };

    let Some(ref path) = args.config else {
        return GlobalConfig::with_root(match root {
            Some(root) => root,
            None => GlobalConfig::default_root()?,
        });
    };

    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let mut table: toml::Table = toml::from_str(&raw)?;
    let root = match root {
        Some(root) => Some(root),
        None if !table.contains_key("root") => Some(GlobalConfig::default_root()?),
        None => None,
    };
    if let Some(root) = root {
        table.insert(
            "root".into(),
            toml::Value::String(root.to_string_lossy().into_owned()),
        );
    }
    let merged = toml::to_string(&table)
        .map_err(|err| AppError::Config(format!("failed to apply root override: {err}")))?;
    GlobalConfig::from_toml_str(&merged)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|err| AppError::Config(format!("invalid root override: {err}")))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

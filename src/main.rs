//! tunneltop binary entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use tracing::info;
#[cfg(unix)]
use tracing::error;

use tunneltop::cli::Cli;
use tunneltop::config::{default_config_path, default_log_path, Config};
#[cfg(unix)]
use tunneltop::supervisor::reconcile;
use tunneltop::supervisor::{scheduler, TunnelSupervisor};
use tunneltop::ui::Display;
use tunneltop::{AppError, Result};

fn main() {
    if let Err(e) = try_main() {
        eprintln!("tunneltop: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.debug)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    // an unreadable or invalid config at startup is fatal
    let config = Config::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::other(format!("failed to build runtime: {e}")))?;
    runtime.block_on(run(args, config_path, config))
}

async fn run(args: Cli, config_path: PathBuf, config: Config) -> Result<()> {
    let supervisor = TunnelSupervisor::new(config);
    supervisor.start_all().await;

    let scheduler_task = tokio::spawn(scheduler::run(Arc::clone(&supervisor)));
    #[cfg(unix)]
    let reload_task = spawn_reload_listener(Arc::clone(&supervisor), config_path);
    #[cfg(not(unix))]
    drop(config_path);

    let display = Display::new(
        Arc::clone(&supervisor),
        !args.noheader,
        Duration::from_secs_f64(args.delay.max(0.1)),
    );
    let result = display.run().await;

    supervisor.shutdown().await;
    scheduler_task.abort();
    let _ = scheduler_task.await;
    #[cfg(unix)]
    {
        reload_task.abort();
        let _ = reload_task.await;
    }
    info!("exited cleanly");
    result
}

/// Reload the configuration and reconcile whenever SIGHUP arrives. A
/// reload that fails to parse is logged and ignored; the running state
/// stays as it was.
#[cfg(unix)]
fn spawn_reload_listener(
    supervisor: Arc<TunnelSupervisor>,
    config_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to install reload handler: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("reload signal received, re-reading {}", config_path.display());
            match Config::load(&config_path) {
                Ok(config) => reconcile::apply(&supervisor, config).await,
                Err(e) => error!("config reload failed: {}", e),
            }
        }
    })
}

/// Debug logging goes to a file; the terminal belongs to the display.
fn init_logging(debug: bool) -> Result<()> {
    if !debug {
        return Ok(());
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(default_log_path())?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tunneltop=debug")),
        )
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

//! wardend — the Warden daemon.
//!
//! Loads `warden.toml`, opens the state store, seeds the configured
//! autoscales and runs the alarm loop until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! wardend --config /etc/warden/warden.toml --data-dir /var/lib/warden
//! ```

mod config;
mod daemon;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_alarm::{AutoScaler, parse_duration};
use warden_expr::ExprEngine;
use warden_state::StateStore;
use warden_wizard::Wizard;

use config::{LogFormat, WardenConfig};

const DEFAULT_FILTER: &str = "info,wardend=debug,warden=debug";

#[derive(Parser)]
#[command(name = "wardend", about = "Warden alarm and autoscale daemon")]
struct Cli {
    /// Path to warden.toml. Without it every setting takes its default.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Check interval such as "30s" (overrides the config file).
    #[arg(long)]
    interval: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.daemon.data_dir = Some(dir);
    }
    if let Some(interval) = cli.interval {
        parse_duration(&interval)
            .filter(|d| !d.is_zero())
            .with_context(|| format!("invalid --interval {interval:?}"))?;
        config.daemon.interval = Some(interval);
    }

    init_tracing(config.daemon.log_format.unwrap_or_default());
    run(config).await
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(config: WardenConfig) -> anyhow::Result<()> {
    info!("Warden daemon starting");

    let interval = config.daemon.interval()?;
    let action_timeout = config.daemon.action_timeout()?;

    // State store.
    let data_dir = config.daemon.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("warden.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Actions and datasources.
    let registry = daemon::build_registry(&config.actions, action_timeout);
    let datasource = daemon::build_datasource(&config.datasources);
    info!(
        actions = config.actions.len(),
        datasources = config.datasources.len(),
        "integrations configured"
    );

    // Declarative autoscales.
    let wizard = Wizard::new(store.clone(), daemon::build_catalog(&config.datasources));
    let seeded = daemon::seed(&store, &wizard, &config.autoscale)?;
    if seeded < config.autoscale.len() {
        warn!(
            configured = config.autoscale.len(),
            seeded, "some configured autoscales were rejected"
        );
    }
    let autoscales = store.list_autoscales()?.len();
    daemon::check_scale_actions(&registry, autoscales);
    info!(seeded, autoscales, "autoscales loaded");

    let scaler = AutoScaler::new(
        store,
        Arc::new(datasource),
        Arc::new(ExprEngine::new()),
        registry,
    )
    .with_action_timeout(action_timeout);

    // Shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(async move {
        scaler.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = loop_handle.await;
    info!("Warden daemon stopped");
    Ok(())
}

// SPDX-License-Identifier: GPL-3.0-only

//! zshare reconciler daemon
//!
//! Keeps ZFS datasets and NFS exports in line with the declared share
//! configuration, then applies configuration events received over D-Bus.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use zbus::connection::Builder as ConnectionBuilder;

use zshare_contracts::BackendAdapter;
use zshare_reconcile::{DryRunBackend, Supervisor};
use zshare_sys::ZfsBackend;
use zshare_types::ActualState;

mod auth;
mod config;
mod error;
mod logging;
mod service;
mod store;

use config::{BackendKind, ServiceConfig};
use service::{BUS_NAME, OBJECT_PATH, ReconcilerService};
use store::TomlConfigStore;

#[derive(Debug, Parser)]
#[command(name = "zshared", version)]
#[command(about = "Reconciles ZFS datasets and NFS exports against declared shares", long_about = None)]
struct Cli {
    /// Service configuration file
    #[arg(long, short, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile at startup, then apply events until interrupted (default)
    Run,
    /// Print drift between the declared configuration and the host, changing nothing
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::load(&cli.config)?;
    logging::init(&config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(config).await,
    }
}

async fn run(config: ServiceConfig) -> Result<()> {
    tracing::info!(
        "Starting zshare reconciler v{} ({:?} backend)",
        env!("CARGO_PKG_VERSION"),
        config.backend
    );

    if config.backend == BackendKind::Zfs && unsafe { libc::geteuid() } != 0 {
        tracing::error!("The zfs backend must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let supervisor = Arc::new(supervisor(&config).await?);
    let report = supervisor.start().await?;
    if !report.pools_failed.is_empty() {
        tracing::warn!("Declared pools unavailable: {}", report.pools_failed.join(", "));
    }

    let connection = if config.dbus {
        let connection = ConnectionBuilder::system()?
            .name(BUS_NAME)?
            .serve_at(
                OBJECT_PATH,
                ReconcilerService::new(supervisor.clone(), config.trusted_callers()),
            )?
            .build()
            .await?;
        tracing::info!("Service registered on D-Bus system bus");
        tracing::info!("  - {} at {}", BUS_NAME, OBJECT_PATH);
        Some(connection)
    } else {
        tracing::info!("D-Bus surface disabled; only startup reconciliation runs");
        None
    };

    tracing::info!("Service ready, waiting for events...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    // Stop accepting events before draining the bus.
    drop(connection);
    let report = supervisor.shutdown().await;
    tracing::info!(
        "zshare reconciler stopped ({} event(s) spooled, {} dropped)",
        report.spooled,
        report.dropped
    );
    Ok(())
}

async fn check(config: ServiceConfig) -> Result<()> {
    let supervisor = supervisor(&config).await?;
    let drift = supervisor.preview().await?;
    println!("{}", serde_json::to_string_pretty(&drift)?);
    if drift.is_clean() {
        tracing::info!("Host matches {}", config.declared_config.display());
    }
    Ok(())
}

async fn supervisor(config: &ServiceConfig) -> Result<Supervisor> {
    let backend = backend(config).await?;
    let store = Arc::new(TomlConfigStore::new(&config.declared_config));
    tracing::debug!("Declared configuration read from {}", store.path().display());
    Ok(Supervisor::new(backend, store, config.supervisor_config()))
}

async fn backend(config: &ServiceConfig) -> Result<Arc<dyn BackendAdapter>> {
    let zfs = ZfsBackend::new(&config.exports_dir, config.command_timeout());
    match config.backend {
        BackendKind::Zfs => Ok(Arc::new(zfs?)),
        BackendKind::DryRun => {
            // Start from the real host when it can be scanned.
            let seed = match zfs {
                Ok(zfs) => match zfs.list_actual_state().await {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!("Host scan failed ({}), dry-run starts empty", e);
                        ActualState::default()
                    }
                },
                Err(e) => {
                    tracing::info!("{}; dry-run starts from an empty host", e);
                    ActualState::default()
                }
            };
            Ok(Arc::new(DryRunBackend::with_state(seed)))
        }
    }
}

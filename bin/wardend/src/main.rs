//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "binary"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Binary entrypoint for the Warden daemon."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
mod admin;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_common::config::AppConfig;
use warden_common::logging::{init_tracing, LogFormat};
use warden_common::net::missing_monitor_addresses;
use warden_core::Monitor;
use warden_membership::SerfAgentKeeper;
use warden_metrics::{new_registry, spawn_http_server, MonitorMetrics};
use warden_persistence::{SharedStore, SqlStore};

use crate::admin::{fencer_command, host_command, show_leader, FencerCommand, HostCommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Warden ", env!("CARGO_PKG_VERSION")),
    about = "Warden host fencing daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured stdout log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Campaign for leadership and monitor hosts")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Keep a serf agent running for every monitor tag on this host")]
    Agent,
    #[command(about = "Create missing tables in the configured database")]
    DbSync,
    #[command(subcommand, about = "Inspect, disable or re-enable monitored hosts")]
    Host(HostCommand),
    #[command(subcommand, about = "Manage the power fencers of a host")]
    Fencer(FencerCommand),
    #[command(about = "Show which controller holds the leader lease")]
    Leader,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("/etc/warden/warden.toml"));
    candidates.push(PathBuf::from("configs/warden.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("wardend", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        elapsed_ms = load_started.elapsed().as_millis() as u64,
        "configuration loaded"
    );

    let mut out = std::io::stdout();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::CheckConfig => check_config(&config),
        Commands::Agent => run_agents(&config).await,
        Commands::DbSync => {
            let store = open_store(&config).await?;
            store.close().await;
            Ok(())
        }
        Commands::Host(command) => {
            let store = open_store(&config).await?;
            host_command(&store, command, &mut out).await
        }
        Commands::Fencer(command) => {
            let store = open_store(&config).await?;
            fencer_command(&store, command, &mut out).await
        }
        Commands::Leader => {
            let store = open_store(&config).await?;
            show_leader(&store, &config.election.name, &mut out).await
        }
    }
}

async fn open_store(config: &AppConfig) -> Result<SqlStore> {
    let store = SqlStore::connect(&config.database)
        .await
        .context("unable to open the database")?;
    store.sync_schema().await.context("unable to sync the database schema")?;
    Ok(store)
}

fn check_config(config: &AppConfig) -> Result<()> {
    let leader = config.leader_name()?;
    for (tag, monitor) in &config.monitors {
        info!(tag = %tag, address = %monitor.address, "monitor configured");
    }
    let missing = missing_monitor_addresses(&config.monitors);
    if !missing.is_empty() {
        warn!(missing = ?missing, "monitor addresses are not bound on this machine");
    }
    info!(
        leader = %leader,
        election = %config.election.name,
        term_secs = config.election.term.as_secs(),
        backend = ?config.remediation.backend,
        fence_ops_disabled = config.fence.disable_fence_ops,
        "configuration is valid"
    );
    Ok(())
}

async fn run_agents(config: &AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    for (tag, monitor) in &config.monitors {
        let keeper = SerfAgentKeeper::from_config(tag, monitor, &config.agent)?;
        info!(tag = %keeper.tag(), address = %monitor.address, "keeping serf agent running");
        tasks.push(tokio::spawn(keeper.run(cancel.child_token())));
    }
    wait_for_shutdown().await?;
    cancel.cancel();
    for result in join_all(tasks).await {
        if let Err(err) = result {
            warn!(error = %err, "serf agent keeper join error");
        }
    }
    info!("agents stopped");
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let leader = config.leader_name()?;
    let store = open_store(&config).await?;
    let registry = new_registry();
    let metrics = MonitorMetrics::new(registry.clone())?;
    metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    if config.fence.disable_fence_ops {
        warn!("fence operations are disabled; failed hosts will not be powered off");
    }

    info!(leader = %leader, database = ?store.dialect(), "campaigning for leadership");
    let shared: SharedStore = Arc::new(store.clone());
    let monitor = Monitor::from_config(leader, config, shared, metrics)
        .context("unable to build remediation backend")?;
    let handle = monitor.start();

    info!("daemon running; waiting for termination signal");
    wait_for_shutdown().await?;
    handle.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    store.close().await;
    info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("unable to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("ctrl-c received; shutting down");
        }
        _ = terminate.recv() => info!("SIGTERM received; shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    Ok(())
}

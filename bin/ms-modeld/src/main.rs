//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "binary"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Binary entrypoint for the model service daemon."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ms_common::{init_tracing, ServiceConfig};
use ms_core::{BroadcastSink, DeviceNameMap, ModelService, RecordingSink};
use ms_metrics::{new_registry, spawn_http_server, ModelMetrics};
use ms_net::{BroadcastHub, BroadcastServerBuilder, PvGatewayBuilder, RpcServerBuilder};
use ms_oracle::LatticeSimulator;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Lattice model service daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the model service")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    Validate,
    #[command(about = "Build the design twiss table once and print it as JSON")]
    DumpTable,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/model-service.toml"));

    let loaded = ServiceConfig::load(&candidates)?;
    let config = loaded.config;
    init_tracing("ms-modeld", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; running with defaults"),
    }
    if let Some(library) = &config.oracle.library_path {
        warn!(
            library = %library.display(),
            "external engine library configured; the bundled lattice simulator is used instead"
        );
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await?,
        Commands::Validate => {
            println!("configuration OK");
        }
        Commands::DumpTable => {
            let service = build_service(
                config,
                Arc::new(RecordingSink::new()),
                ModelMetrics::unregistered()?,
            )?;
            let document = service.tables().design().to_document();
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }

    Ok(())
}

fn build_service(
    config: ServiceConfig,
    sink: Arc<dyn BroadcastSink>,
    metrics: ModelMetrics,
) -> Result<ModelService> {
    let devices = DeviceNameMap::from_optional(config.devices.csv_path.as_deref())
        .context("failed to load device name map")?;
    info!(mapped = devices.len(), "device name map loaded");
    let simulator = LatticeSimulator::new(&config.oracle.simulator);
    info!(elements = simulator.len(), end = simulator.end_index(), "lattice simulator ready");
    ModelService::new(config, Box::new(simulator), Arc::new(devices), sink, metrics)
}

async fn run_daemon(config: ServiceConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = ModelMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let hub = BroadcastHub::new(config.broadcast.capacity);
    let broadcast_server = BroadcastServerBuilder::new(config.broadcast.listen, hub.clone())
        .spawn()
        .await?;

    let rpc_listen = config.rpc.listen;
    let pv = config.pv.clone();
    let service = build_service(config, Arc::new(hub), metrics)?.start();

    let rpc_server = RpcServerBuilder::new(rpc_listen, service.rpc()).spawn().await?;

    let pv_gateway = if pv.enabled {
        let gateway = PvGatewayBuilder::new(pv.listen, service.tables(), service.router())
            .with_metrics_registry(registry)
            .spawn()
            .await?;
        Some(gateway)
    } else {
        info!("pv gateway disabled by configuration");
        None
    };

    info!("model service running; waiting for termination signal");
    wait_for_termination().await?;
    info!("termination signal received; shutting down");

    rpc_server.shutdown().await?;
    if let Some(gateway) = pv_gateway {
        gateway.shutdown().await?;
    }
    service.shutdown().await?;
    broadcast_server.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_termination() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

//! aria-relay - Main Entry Point
//!
//! Runs the command channel and the supervised pipeline against the simulated
//! device until Ctrl-C, or pairs the host with a device.

use anyhow::Context;
use aria_relay::{
    backend::{AriaCli, MockDeviceBackend, DEFAULT_PAIRING_WAIT},
    config::RelayConfig,
    logging,
    pipeline::{BroadcastForwarder, EventBus, InferenceForwarder, Supervisor},
    server::{CommandServer, PeerSlot},
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "aria-relay", version, about)]
struct Cli {
    /// Config file (defaults to ARIA_RELAY_CONFIG, ./aria-relay.toml, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the command channel port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the relay until Ctrl-C (default)
    Serve,
    /// Pair this host with a device through the vendor CLI
    Pair,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::load_resolved(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    let _log_guard = logging::init(&config.logging);

    match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => serve(config).await,
        CliCommand::Pair => pair().await,
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    tracing::info!("Starting aria-relay");

    let client = Arc::new(MockDeviceBackend::from_settings(&config.simulator));
    let bus = EventBus::with_settings(&config.bus);
    let peers = PeerSlot::new();

    let supervisor = Supervisor::new(client, bus, config.pipeline_settings());
    if config.inference.enabled {
        supervisor.add_consumer(Arc::new(InferenceForwarder::factory(&config.inference)?));
    }
    if config.broadcast.enabled {
        supervisor.add_consumer(Arc::new(BroadcastForwarder::factory(
            peers.clone(),
            &config.broadcast,
        )));
    }

    let server = CommandServer::bind(&config.server, supervisor.clone(), peers).await?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down...");
    shutdown.cancel();
    if let Some(exit) = supervisor.shutdown().await {
        tracing::info!("Pipeline finished: {}", exit);
    }
    server_task.await.context("Command channel task failed")??;
    Ok(())
}

async fn pair() -> anyhow::Result<()> {
    let status = AriaCli::default().ensure_paired(DEFAULT_PAIRING_WAIT).await?;
    tracing::info!("Pairing status: {:?}", status);
    if !status.is_paired() {
        anyhow::bail!("Device is not paired");
    }
    Ok(())
}

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sidekick::cli::{Cli, Commands, ModeArgs};
use sidekick::config::Settings;
use sidekick::ports::PortResolver;
use sidekick::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { mode } => run(mode).await,
        Commands::Ports { mode } => print_ports(mode),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(mode: ModeArgs) -> anyhow::Result<()> {
    let settings: Settings = mode.into_settings()?;
    let mut supervisor = Supervisor::new(settings);
    supervisor.start().await.context("starting services")?;

    for (service, port) in supervisor.service_ports() {
        info!(service = %service, port, "supervised");
    }
    if let Some(url) = supervisor.websocket_url() {
        info!(%url, "speech websocket endpoint");
    }

    tokio::signal::ctrl_c().await.ok();
    eprintln!("\nShutting down...");

    supervisor.stop();
    match tokio::time::timeout(Duration::from_secs(10), supervisor.wait_stopped()).await {
        Ok(()) => info!("All services stopped cleanly"),
        Err(_) => tracing::warn!("Shutdown timed out; some processes may have been force-killed"),
    }
    Ok(())
}

fn print_ports(mode: ModeArgs) -> anyhow::Result<()> {
    let settings = mode.into_settings()?;
    let config = PortResolver::new(settings.ports_path()).load();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

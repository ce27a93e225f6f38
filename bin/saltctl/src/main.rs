//! saltctl keeps a Saltbox host's containers ordered and its hosts file
//! current.

mod cli;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use cli::{Cli, Commands, ControllerArgs, UpdateHostsArgs};
use saltctl_control::{Config, HostsSync, SaltDocker, serve};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    match cli.command {
        Commands::Controller(args) => run_controller(config, args, shutdown_rx).await,
        Commands::UpdateHosts(args) => run_update_hosts(config, args, shutdown_rx).await,
    }
}

/// Flip the shared shutdown flag on SIGTERM or SIGINT. Loops observe the
/// flag between iterations and exit promptly.
fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Received shutdown signal, shutting down gracefully...");
        shutdown.send(true).ok();
    });
}

async fn run_controller(
    mut config: Config,
    args: ControllerArgs,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(bind) = args.bind {
        config.controller.bind = bind;
    }
    serve(&config.controller, shutdown).await
}

async fn run_update_hosts(
    mut config: Config,
    args: UpdateHostsArgs,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(network) = args.network {
        config.hosts.network = network;
    }
    if let Some(suffix) = args.suffix {
        config.hosts.suffix = suffix;
    }
    if let Some(path) = args.hosts_file {
        config.hosts.hosts_path = path;
    }
    if let Some(path) = args.backup_file {
        config.hosts.backup_path = path;
    }

    let docker = SaltDocker::connect().await?;
    HostsSync::new(docker, &config.hosts, args.interval, shutdown)
        .run()
        .await
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "saltctl")]
#[command(
    author,
    version,
    about = "Container dependency controller and hosts synchronizer for a Saltbox host"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "SALTCTL_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a saltctl.toml configuration file, or a directory containing
    /// one. Defaults are used when not provided.
    #[arg(short, long, env = "SALTCTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the container dependency controller HTTP service.
    Controller(ControllerArgs),
    /// Keep the hosts file in sync with container network aliases.
    UpdateHosts(UpdateHostsArgs),
}

#[derive(Args, Default)]
pub struct ControllerArgs {
    /// Override the address the control surface binds to.
    #[arg(long, env = "SALTCTL_BIND")]
    pub bind: Option<SocketAddr>,
}

#[derive(Args)]
pub struct UpdateHostsArgs {
    /// Interval between full resyncs (e.g. 30s, 10m, 1h).
    #[arg(
        long,
        env = "SALTCTL_RESYNC_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "1h"
    )]
    pub interval: Duration,

    /// Override the Docker network whose attachments are mirrored.
    #[arg(long, env = "SALTCTL_HOSTS_NETWORK")]
    pub network: Option<String>,

    /// Override the domain suffix appended to each alias.
    #[arg(long, env = "SALTCTL_HOSTS_SUFFIX")]
    pub suffix: Option<String>,

    /// Override the hosts file path.
    #[arg(long, env = "SALTCTL_HOSTS_FILE")]
    pub hosts_file: Option<PathBuf>,

    /// Override the hosts backup path.
    #[arg(long, env = "SALTCTL_HOSTS_BACKUP")]
    pub backup_file: Option<PathBuf>,
}

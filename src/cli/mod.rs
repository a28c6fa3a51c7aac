//! Command-line interface for repman.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// repman - replication manager for MariaDB and MySQL clusters.
#[derive(Parser)]
#[command(name = "repman")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "REPMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "REPMAN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the monitor loop over the configured cluster
    Monitor,

    /// Provision the declared fleet and wire the configured topology
    Bootstrap {
        /// Skip the replication cleanup pass before wiring
        #[arg(long)]
        no_clean: bool,
    },

    /// Planned master change onto the best candidate slave
    Switchover,

    /// Reactive master change; assumes the old master is gone
    Failover,

    /// Provision all declared database and proxy services
    Provision,

    /// Unprovision everything and clear cookies
    Unprovision,

    /// Print the current cluster topology as JSON
    Status,

    /// Print version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

//! repman - a replication manager for MariaDB and MySQL clusters.
//!
//! repman is a long-lived supervisor over a declared set of database
//! instances: it monitors every server, classifies cluster topology,
//! detects master failure, drives automatic failover and operator
//! switchover, and wires fresh fleets into one of the supported
//! replication topologies.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         repman                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Control: Bootstrap | Switchover | Failover | Provisioning  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster: Topology Discovery | State Machine | Event Bus    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Monitors: per-server probe | refresh | capture             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends: MySQL driver | Fleet simulator | Orchestrators   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use repman::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> repman::Result<()> {
//!     let config = Config::development();
//!     repman::run(config).await
//! }
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gtid;
pub mod observability;
pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod state;
pub mod topology;

// Re-exports
pub use error::{RepmanError, Result};

use cluster::Cluster;
use config::Config;
use shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tracing::info;

/// Run the supervisor over one cluster until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    observability::init(&config.observability)?;
    std::fs::create_dir_all(&config.cluster.working_dir)?;

    info!(cluster = %config.cluster.name, "Starting repman supervisor");

    let connector = Arc::new(db::mysql::MysqlConnector);
    let cluster = Cluster::new(Arc::new(config), connector)?;

    let coordinator = ShutdownCoordinator::new();
    tokio::spawn(shutdown::listen_for_signals(coordinator.clone()));

    cluster.run(coordinator).await;

    info!("repman shutdown complete");
    Ok(())
}

//! repman CLI - Main entry point.

use repman::cli::{Cli, Commands};
use repman::cluster::{bootstrap, failover, provision, Cluster};
use repman::config::Config;
use repman::db::mysql::MysqlConnector;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::development(),
    };
    config.observability.log_level = cli.log_level.clone();

    match cli.command {
        Commands::Monitor => {
            repman::run(config).await?;
        }

        Commands::Bootstrap { no_clean } => {
            let cluster = connected_cluster(config).await?;
            if no_clean {
                bootstrap::bootstrap_replication(&cluster, false).await?;
            } else {
                bootstrap::bootstrap(&cluster).await?;
            }
            println!(
                "Bootstrap complete, master: {}",
                master_url(&cluster).await.unwrap_or_default()
            );
        }

        Commands::Switchover => {
            let cluster = connected_cluster(config).await?;
            failover::switchover(&cluster).await?;
            println!(
                "Switchover complete, new master: {}",
                master_url(&cluster).await.unwrap_or_default()
            );
        }

        Commands::Failover => {
            let cluster = connected_cluster(config).await?;
            failover::master_failover(&cluster).await?;
            println!(
                "Failover complete, new master: {}",
                master_url(&cluster).await.unwrap_or_default()
            );
        }

        Commands::Provision => {
            let cluster = connected_cluster(config).await?;
            provision::provision_all(&cluster).await?;
            println!("Provisioning complete");
        }

        Commands::Unprovision => {
            let cluster = connected_cluster(config).await?;
            provision::unprovision_all(&cluster).await?;
            println!("Unprovision complete");
        }

        Commands::Status => {
            let cluster = connected_cluster(config).await?;
            let snapshot = repman::snapshot::build(&cluster).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Commands::Version => {
            println!("repman v{}", env!("CARGO_PKG_VERSION"));
            println!("Replication manager for MariaDB and MySQL clusters");
        }
    }

    Ok(())
}

/// Build the cluster and run two monitoring ticks so connections are
/// adopted and the topology is discovered before a one-shot command runs.
async fn connected_cluster(mut config: Config) -> anyhow::Result<Arc<Cluster>> {
    repman::observability::init(&config.observability)?;
    if config.cluster.working_dir.as_os_str().is_empty() {
        config.cluster.working_dir = std::env::temp_dir().join("repman");
    }
    std::fs::create_dir_all(&config.cluster.working_dir)?;

    let cluster = Cluster::new(Arc::new(config), Arc::new(MysqlConnector))?;
    for _ in 0..2 {
        cluster.tick().await;
    }
    Ok(cluster)
}

async fn master_url(cluster: &Arc<Cluster>) -> Option<String> {
    let master = cluster.master().await?;
    let url = master.read().await.url.clone();
    Some(url)
}

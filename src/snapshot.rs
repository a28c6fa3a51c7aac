//! Persisted cluster state snapshot.
//!
//! Written after each successful topology discovery to
//! `<workdir>/<cluster>.json`, removed on re-provision so a rebuilt fleet
//! starts from a clean slate.

use crate::cluster::Cluster;
use crate::error::Result;
use crate::server::ServerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-server slice of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub url: String,
    pub state: ServerState,
    pub fail_count: u32,
    pub read_only: bool,
    pub is_slave: bool,
    pub is_relay: bool,
    pub version: String,
    pub current_gtid: String,
    pub slave_gtid: String,
    pub binlog_file: String,
    pub binlog_pos: u64,
}

/// The whole-cluster snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: String,
    pub topology: String,
    pub timestamp: DateTime<Utc>,
    pub is_discovered: bool,
    pub master: Option<String>,
    pub vmaster: Option<String>,
    pub servers: Vec<ServerSnapshot>,
}

/// Snapshot file path for a cluster.
pub fn path(cluster: &Cluster) -> PathBuf {
    cluster
        .conf
        .cluster
        .working_dir
        .join(format!("{}.json", cluster.name))
}

/// Build the snapshot from live state.
pub async fn build(cluster: &Cluster) -> ClusterSnapshot {
    let pointers = cluster.pointers().await;
    let mut servers = Vec::with_capacity(cluster.servers.len());
    for server in &cluster.servers {
        let server = server.read().await;
        servers.push(ServerSnapshot {
            id: server.id.clone(),
            url: server.url.clone(),
            state: server.state,
            fail_count: server.fail_count,
            read_only: server.read_only,
            is_slave: server.is_slave,
            is_relay: server.is_relay,
            version: server.version.to_string(),
            current_gtid: server.current_gtid.to_string(),
            slave_gtid: server.slave_gtid.to_string(),
            binlog_file: server.master_status.file.clone(),
            binlog_pos: server.master_status.position,
        });
    }

    let url_of = |idx: Option<usize>| -> Option<String> {
        idx.map(|i| servers.get(i).map(|s| s.url.clone()).unwrap_or_default())
    };

    ClusterSnapshot {
        cluster: cluster.name.clone(),
        topology: cluster.conf.topology_kind().to_string(),
        timestamp: Utc::now(),
        is_discovered: cluster.sme.is_discovered(),
        master: url_of(pointers.master),
        vmaster: url_of(pointers.vmaster),
        servers,
    }
}

/// Write the snapshot to disk.
pub async fn write(cluster: &Cluster) -> Result<()> {
    let snapshot = build(cluster).await;
    let json = serde_json::to_vec_pretty(&snapshot)?;
    tokio::fs::write(path(cluster), json).await?;
    Ok(())
}

/// Remove the snapshot, e.g. before re-provisioning. Missing file is fine.
pub fn remove(cluster: &Cluster) {
    let _ = std::fs::remove_file(path(cluster));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::simulator::SimFleet;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn sim_cluster(tmp: &TempDir) -> Arc<Cluster> {
        let fleet = SimFleet::new();
        fleet.add_server("127.0.0.1", 3306, "10.5.9-MariaDB-log");
        let mut conf = Config::development();
        conf.cluster.servers = vec!["127.0.0.1:3306".to_string()];
        conf.cluster.working_dir = tmp.path().to_path_buf();
        Cluster::new(Arc::new(conf), fleet.connector()).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_remove() {
        let tmp = TempDir::new().unwrap();
        let cluster = sim_cluster(&tmp).await;

        write(&cluster).await.unwrap();
        let p = path(&cluster);
        assert!(p.exists());

        let content = std::fs::read_to_string(&p).unwrap();
        let snapshot: ClusterSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.cluster, "dev");
        assert_eq!(snapshot.servers.len(), 1);
        assert_eq!(snapshot.servers[0].state, ServerState::Suspect);

        remove(&cluster);
        assert!(!p.exists());
        // Idempotent.
        remove(&cluster);
    }

    #[tokio::test]
    async fn test_state_token_serialization() {
        let tmp = TempDir::new().unwrap();
        let cluster = sim_cluster(&tmp).await;
        let snapshot = build(&cluster).await;
        let json = serde_json::to_string(&snapshot).unwrap();
        // State tokens are contract and appear verbatim.
        assert!(json.contains("\"Suspect\""));
    }
}

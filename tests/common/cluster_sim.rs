//! Simulated cluster builder for integration tests.
//!
//! Wraps a [`SimFleet`] and a [`Cluster`] over a temporary working
//! directory, with knobs for topology flags and failure injection.

use repman::cluster::Cluster;
use repman::config::Config;
use repman::db::simulator::{SimFleet, SimHandle};
use repman::server::ServerState;
use std::sync::Arc;
use tempfile::TempDir;

const BASE_PORT: u16 = 3306;

/// Builder over a simulated MariaDB/MySQL fleet.
pub struct ClusterBuilder {
    name: String,
    versions: Vec<String>,
    mutators: Vec<Box<dyn FnOnce(&mut Config)>>,
}

impl ClusterBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versions: Vec::new(),
            mutators: Vec::new(),
        }
    }

    /// Declare `count` MariaDB 10.5 servers on consecutive ports.
    pub fn mariadb_servers(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.versions.push("10.5.9-MariaDB-log".to_string());
        }
        self
    }

    /// Declare `count` MySQL 8.0 servers on consecutive ports.
    #[allow(dead_code)]
    pub fn mysql_servers(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.versions.push("8.0.30".to_string());
        }
        self
    }

    /// Apply an arbitrary configuration tweak.
    pub fn configure(mut self, f: impl FnOnce(&mut Config) + 'static) -> Self {
        self.mutators.push(Box::new(f));
        self
    }

    pub async fn build(self) -> SimCluster {
        let workdir = TempDir::new().expect("tempdir");
        let fleet = SimFleet::new();
        let mut servers = Vec::new();
        for (i, version) in self.versions.iter().enumerate() {
            let port = BASE_PORT + i as u16;
            fleet.add_server("127.0.0.1", port, version);
            servers.push(format!("127.0.0.1:{}", port));
        }

        let mut conf = Config::development();
        conf.cluster.name = self.name;
        conf.cluster.servers = servers;
        conf.cluster.working_dir = workdir.path().to_path_buf();
        conf.monitoring.max_fail = 3;
        for mutate in self.mutators {
            mutate(&mut conf);
        }

        let cluster = Cluster::new(Arc::new(conf), fleet.connector()).expect("cluster");
        SimCluster {
            fleet,
            cluster,
            _workdir: workdir,
        }
    }
}

/// A built simulated cluster.
pub struct SimCluster {
    pub fleet: SimFleet,
    pub cluster: Arc<Cluster>,
    _workdir: TempDir,
}

impl SimCluster {
    /// Handle for the server at `idx` in declaration order.
    pub fn handle(&self, idx: usize) -> SimHandle {
        self.fleet
            .handle("127.0.0.1", BASE_PORT + idx as u16)
            .expect("handle")
    }

    /// Run `count` monitoring ticks.
    pub async fn tick(&self, count: usize) {
        for _ in 0..count {
            self.cluster.tick().await;
        }
    }

    pub async fn state_of(&self, idx: usize) -> ServerState {
        self.cluster.servers[idx].read().await.state
    }

    pub async fn fail_count_of(&self, idx: usize) -> u32 {
        self.cluster.servers[idx].read().await.fail_count
    }

    pub async fn master_index(&self) -> Option<usize> {
        self.cluster.master_index().await
    }
}

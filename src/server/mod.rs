//! Per-server monitor record.
//!
//! One [`ServerMonitor`] exists per declared database instance. Its mutable
//! attributes are written only by its own monitor task, by the controller
//! holding the failover gate, or by explicit operator calls; the cluster
//! back-pointer is an index into the cluster's server table, never an owning
//! reference.

pub mod capture;
pub mod cookies;
pub mod monitor;
pub mod refresh;

use crate::config::{split_host_port, Config};
use crate::db::{
    DatabaseClient, EventEntry, Grant, MasterStatus, Plugin, ProcessEntry, ServerVersion,
    SlaveStatus,
};
use crate::error::{RepmanError, Result};
use crate::gtid::GtidList;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to one server monitor.
pub type ServerRef = Arc<RwLock<ServerMonitor>>;

/// Per-server state tokens. The spellings are contract: they appear in
/// alerts and persisted snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    Failed,
    Master,
    Slave,
    SlaveErr,
    SlaveLate,
    Maintenance,
    StandAlone,
    ErrorAuth,
    Suspect,
    Shard,
    Provision,
    MasterAlone,
    Relay,
    RelayErr,
    RelayLate,
    Wsrep,
    WsrepDonor,
    WsrepUnsync,
}

impl ServerState {
    pub fn is_failed(&self) -> bool {
        matches!(self, ServerState::Failed)
    }

    pub fn is_slave_like(&self) -> bool {
        matches!(
            self,
            ServerState::Slave | ServerState::SlaveErr | ServerState::SlaveLate
        )
    }

    pub fn is_relay_like(&self) -> bool {
        matches!(
            self,
            ServerState::Relay | ServerState::RelayErr | ServerState::RelayLate
        )
    }

    /// States under which the fail counter keeps accumulating.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ServerState::Failed | ServerState::ErrorAuth | ServerState::Suspect
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Failed => "Failed",
            ServerState::Master => "Master",
            ServerState::Slave => "Slave",
            ServerState::SlaveErr => "SlaveErr",
            ServerState::SlaveLate => "SlaveLate",
            ServerState::Maintenance => "Maintenance",
            ServerState::StandAlone => "StandAlone",
            ServerState::ErrorAuth => "ErrorAuth",
            ServerState::Suspect => "Suspect",
            ServerState::Shard => "Shard",
            ServerState::Provision => "Provision",
            ServerState::MasterAlone => "MasterAlone",
            ServerState::Relay => "Relay",
            ServerState::RelayErr => "RelayErr",
            ServerState::RelayLate => "RelayLate",
            ServerState::Wsrep => "Wsrep",
            ServerState::WsrepDonor => "WsrepDonor",
            ServerState::WsrepUnsync => "WsrepUnsync",
        };
        f.write_str(s)
    }
}

/// Stable identifier for a (host, port) pair. FNV-1a over the bytes, which
/// survives process restarts unlike the std hasher.
pub fn stable_id(host: &str, port: u16) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in host.as_bytes().iter().chain(port.to_string().as_bytes()) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// One monitored database instance.
pub struct ServerMonitor {
    // Identity
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub service_name: String,

    /// Persistent database handle; absent while unreachable.
    pub conn: Option<Arc<dyn DatabaseClient>>,

    // Classification
    pub state: ServerState,
    pub prev_state: ServerState,
    pub fail_count: u32,
    /// Heartbeat counter value at first suspicion.
    pub fail_suspect_heartbeat: u64,

    // Role flags
    pub is_slave: bool,
    pub is_relay: bool,
    pub is_maxscale: bool,
    pub is_virtual_master: bool,
    pub is_maintenance: bool,
    pub is_delayed: bool,
    pub is_full: bool,
    pub ignored: bool,
    pub prefered: bool,
    pub prefered_backup: bool,

    // Observed attributes
    pub version: ServerVersion,
    pub server_id: u64,
    pub read_only: bool,
    pub variables: HashMap<String, String>,
    pub status: HashMap<String, String>,
    pub prev_status: HashMap<String, String>,

    // Replication position
    pub master_status: MasterStatus,
    pub binlog_file_previous: String,
    pub binary_logs: Vec<String>,
    pub gtid_binlog_pos: GtidList,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub io_gtid: GtidList,
    pub executed_gtid_set: String,
    pub replications: Vec<SlaveStatus>,
    pub last_seen_replications: Vec<SlaveStatus>,
    pub replication_source_name: String,

    // Feature flags learned from the backend
    pub have_semi_sync: bool,
    pub semi_sync_master_status: bool,
    pub semi_sync_slave_status: bool,
    pub have_binlog: bool,
    pub have_binlog_row: bool,
    pub have_gtid_strict_mode: bool,
    pub have_mysql_gtid: bool,
    pub have_mariadb_gtid: bool,
    pub have_wsrep: bool,
    pub have_event_scheduler: bool,
    pub have_read_only: bool,
    pub is_wsrep_sync: bool,
    pub is_wsrep_donor: bool,
    pub is_wsrep_primary: bool,

    // Monitoring extras
    pub qps: i64,
    pub monitor_time: i64,
    pub prev_monitor_time: i64,
    pub binlog_dump_threads: usize,
    pub process_list: Vec<ProcessEntry>,
    pub innodb_status: String,
    pub event_status: Vec<EventEntry>,
    pub users: Vec<Grant>,
    pub plugins: Vec<Plugin>,
    pub in_capture_mode: bool,

    /// max_connections cached before a switchover reduces it.
    pub max_conn_saved: Option<u64>,

    /// Per-server working directory (logs, cookies, orchestrator payloads).
    pub datadir: PathBuf,
}

impl ServerMonitor {
    /// Register a declared server. Creates the per-server working
    /// directory tree and empty log files on first sight.
    pub fn new(conf: &Config, url: &str) -> Result<Self> {
        let (host, port) = split_host_port(url)
            .ok_or_else(|| RepmanError::Config(format!("Invalid server URL: {}", url)))?;
        let url = format!("{}:{}", host, port);
        let id = format!("db{}", stable_id(&format!("{}{}", conf.cluster.name, host), port));
        let service_name = format!("{}/svc/{}", conf.cluster.name, host);

        let datadir = conf
            .cluster
            .working_dir
            .join(&conf.cluster.name)
            .join(format!("{}_{}", host, port));
        for sub in ["log", "var", "init", "bck"] {
            std::fs::create_dir_all(datadir.join(sub))?;
        }
        for log in ["log/log_error.log", "log/log_slow_query.log"] {
            let path = datadir.join(log);
            if !path.exists() {
                std::fs::File::create(&path)?;
            }
        }

        Ok(Self {
            id,
            name: host.clone(),
            host,
            port,
            service_name,
            conn: None,
            state: ServerState::Suspect,
            prev_state: ServerState::Suspect,
            fail_count: 0,
            fail_suspect_heartbeat: 0,
            is_slave: false,
            is_relay: false,
            // Treated as maxscale until discovered, to avoid sending
            // commands an eventual binlog relay would reject.
            is_maxscale: conf.topology.mxs_binlog,
            is_virtual_master: false,
            is_maintenance: false,
            is_delayed: conf.is_delayed(&url),
            is_full: false,
            ignored: conf.is_ignored(&url),
            prefered: conf.is_preferred(&url),
            prefered_backup: conf.is_preferred_backup(&url),
            version: ServerVersion::unknown(),
            server_id: 0,
            read_only: false,
            variables: HashMap::new(),
            status: HashMap::new(),
            prev_status: HashMap::new(),
            master_status: MasterStatus::default(),
            binlog_file_previous: String::new(),
            binary_logs: Vec::new(),
            gtid_binlog_pos: GtidList::default(),
            current_gtid: GtidList::default(),
            slave_gtid: GtidList::default(),
            io_gtid: GtidList::default(),
            executed_gtid_set: String::new(),
            replications: Vec::new(),
            last_seen_replications: Vec::new(),
            replication_source_name: conf.replication.master_conn.clone(),
            have_semi_sync: true,
            semi_sync_master_status: false,
            semi_sync_slave_status: false,
            have_binlog: true,
            have_binlog_row: true,
            have_gtid_strict_mode: false,
            have_mysql_gtid: false,
            have_mariadb_gtid: false,
            have_wsrep: false,
            have_event_scheduler: false,
            have_read_only: false,
            is_wsrep_sync: false,
            is_wsrep_donor: false,
            is_wsrep_primary: false,
            qps: 0,
            monitor_time: 0,
            prev_monitor_time: 0,
            binlog_dump_threads: 0,
            process_list: Vec::new(),
            innodb_status: String::new(),
            event_status: Vec::new(),
            users: Vec::new(),
            plugins: Vec::new(),
            in_capture_mode: false,
            max_conn_saved: None,
            datadir,
            url,
        })
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    pub fn is_down(&self) -> bool {
        matches!(
            self.state,
            ServerState::Failed | ServerState::ErrorAuth | ServerState::Suspect
        )
    }

    /// Replication record for the configured channel.
    pub fn slave_status(&self) -> Option<&SlaveStatus> {
        SlaveStatus::for_channel(&self.replications, &self.replication_source_name)
    }

    pub fn has_replication_sql_thread_running(&self) -> bool {
        self.slave_status()
            .map(|ss| ss.slave_sql_running)
            .unwrap_or(false)
    }

    /// Connection handle or an error naming the server.
    pub fn conn(&self) -> Result<Arc<dyn DatabaseClient>> {
        self.conn
            .clone()
            .ok_or_else(|| RepmanError::NotConnected(self.url.clone()))
    }

    pub fn set_maintenance(&mut self, on: bool) {
        self.is_maintenance = on;
        if on {
            self.state = ServerState::Maintenance;
        }
    }

    // Cookie operations; failures are logged by callers that care.

    pub fn set_provision_cookie(&self) {
        let _ = cookies::set(&self.datadir, cookies::Cookie::Provision);
    }

    pub fn del_provision_cookie(&self) {
        let _ = cookies::clear(&self.datadir, cookies::Cookie::Provision);
    }

    pub fn del_reprovision_cookie(&self) {
        let _ = cookies::clear(&self.datadir, cookies::Cookie::Reprovision);
    }

    pub fn del_restart_cookie(&self) {
        let _ = cookies::clear(&self.datadir, cookies::Cookie::Restart);
    }

    pub fn del_wait_start_cookie(&self) {
        let _ = cookies::clear(&self.datadir, cookies::Cookie::WaitStart);
    }

    pub fn del_wait_stop_cookie(&self) {
        let _ = cookies::clear(&self.datadir, cookies::Cookie::WaitStop);
    }

    pub fn has_provision_cookie(&self) -> bool {
        cookies::has(&self.datadir, cookies::Cookie::Provision)
    }

    pub fn clear_all_cookies(&self) {
        cookies::clear_all(&self.datadir);
    }
}

impl fmt::Debug for ServerMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMonitor")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("fail_count", &self.fail_count)
            .field("is_slave", &self.is_slave)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(workdir: &std::path::Path) -> Config {
        let mut conf = Config::development();
        conf.cluster.working_dir = workdir.to_path_buf();
        conf
    }

    #[test]
    fn test_state_tokens_are_contract() {
        assert_eq!(ServerState::Failed.to_string(), "Failed");
        assert_eq!(ServerState::StandAlone.to_string(), "StandAlone");
        assert_eq!(ServerState::ErrorAuth.to_string(), "ErrorAuth");
        assert_eq!(ServerState::WsrepUnsync.to_string(), "WsrepUnsync");
        assert_eq!(ServerState::MasterAlone.to_string(), "MasterAlone");
    }

    #[test]
    fn test_stable_id_is_deterministic() {
        assert_eq!(stable_id("db1", 3306), stable_id("db1", 3306));
        assert_ne!(stable_id("db1", 3306), stable_id("db1", 3307));
        assert_ne!(stable_id("db1", 3306), stable_id("db2", 3306));
    }

    #[test]
    fn test_new_creates_datadir_tree() {
        let tmp = TempDir::new().unwrap();
        let conf = test_config(tmp.path());
        let server = ServerMonitor::new(&conf, "127.0.0.1:3306").unwrap();

        assert!(server.datadir.join("log/log_error.log").exists());
        assert!(server.datadir.join("log/log_slow_query.log").exists());
        for sub in ["var", "init", "bck"] {
            assert!(server.datadir.join(sub).is_dir());
        }
        assert_eq!(server.state, ServerState::Suspect);
        assert_eq!(server.url, "127.0.0.1:3306");
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let tmp = TempDir::new().unwrap();
        let conf = test_config(tmp.path());
        assert!(ServerMonitor::new(&conf, "nonsense").is_err());
    }

    #[test]
    fn test_role_flags_from_config() {
        let tmp = TempDir::new().unwrap();
        let mut conf = test_config(tmp.path());
        conf.topology.pref_master = Some("127.0.0.1:3306".to_string());
        conf.topology.ignored_hosts = vec!["127.0.0.1:3307".to_string()];

        let a = ServerMonitor::new(&conf, "127.0.0.1:3306").unwrap();
        let b = ServerMonitor::new(&conf, "127.0.0.1:3307").unwrap();
        assert!(a.prefered);
        assert!(!a.ignored);
        assert!(b.ignored);
    }

    #[test]
    fn test_cookies_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let conf = test_config(tmp.path());
        let server = ServerMonitor::new(&conf, "127.0.0.1:3306").unwrap();

        assert!(!server.has_provision_cookie());
        server.set_provision_cookie();
        assert!(server.has_provision_cookie());
        server.del_provision_cookie();
        assert!(!server.has_provision_cookie());
    }
}

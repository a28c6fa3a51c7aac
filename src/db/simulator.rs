//! In-memory database fleet simulator.
//!
//! Implements [`Connector`] and [`DatabaseClient`] over scriptable state so
//! that bootstrap, monitoring and failover logic can be exercised without a
//! real backend. Each simulated server models exactly the surface the core
//! consumes: variables, status counters, master/slave status, replication
//! channels, long-running writes.
//!
//! Tests drive faults through [`SimHandle`]: unreachability, auth failure,
//! disk-full, replication lag and errors.

use super::{
    ChangeMasterOpt, Connector, DatabaseClient, DbError, EventEntry, Grant, MasterStatus,
    MasterUseGtid, Plugin, ProcessEntry, ServerVersion, SlaveStatus, UsingGtid,
};
use crate::config::Credentials;
use crate::gtid::{Gtid, GtidList};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// A fleet of simulated servers, shared by the connector and by test code.
#[derive(Clone, Default)]
pub struct SimFleet {
    inner: Arc<Mutex<HashMap<String, Arc<SimServer>>>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server. The URL is `host:port`.
    pub fn add_server(&self, host: &str, port: u16, version: &str) -> SimHandle {
        let url = format!("{}:{}", host, port);
        let server = Arc::new(SimServer {
            fleet: Arc::downgrade(&self.inner),
            state: Mutex::new(SimState::new(host, port, version)),
        });
        self.inner.lock().insert(url, Arc::clone(&server));
        SimHandle { server }
    }

    pub fn handle(&self, host: &str, port: u16) -> Option<SimHandle> {
        let url = format!("{}:{}", host, port);
        self.inner
            .lock()
            .get(&url)
            .map(|server| SimHandle {
                server: Arc::clone(server),
            })
    }

    /// A connector resolving against this fleet.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(SimConnector {
            fleet: self.clone(),
        })
    }
}

/// Test control surface for one simulated server.
#[derive(Clone)]
pub struct SimHandle {
    server: Arc<SimServer>,
}

impl SimHandle {
    pub fn set_unreachable(&self, unreachable: bool) {
        self.server.state.lock().reachable = !unreachable;
    }

    pub fn set_auth_fail(&self, fail: bool) {
        self.server.state.lock().auth_fail = fail;
    }

    pub fn set_disk_full(&self, full: bool) {
        self.server.state.lock().disk_full = full;
    }

    /// Report channel absence as error 1617 instead of an empty result set.
    pub fn set_no_channel_error(&self, on: bool) {
        self.server.state.lock().no_channel_error = on;
    }

    pub fn set_variable(&self, name: &str, value: &str) {
        self.server
            .state
            .lock()
            .variables
            .insert(name.to_uppercase(), value.to_string());
    }

    pub fn set_status(&self, name: &str, value: &str) {
        self.server
            .state
            .lock()
            .status
            .insert(name.to_uppercase(), value.to_string());
    }

    /// Record transactions on this server's own GTID position.
    pub fn advance_gtid(&self, domain_id: u32, count: u64) {
        let mut state = self.server.state.lock();
        let server_id = state.server_id;
        let base = state
            .current_gtid
            .seq_for_domain(domain_id)
            .unwrap_or(0);
        state.current_gtid.advance(Gtid {
            domain_id,
            server_id,
            seq_no: base + count,
        });
        state.binlog_pos += count * 512;
    }

    /// Script replication lag on a channel: the SQL position trails the IO
    /// position, converging one step per status poll.
    pub fn set_channel_lag(&self, channel: &str, io_pos: &str, slave_pos: &str, catchup_polls: u32) {
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.gtid_io_pos = GtidList::parse(io_pos);
            ch.gtid_slave_pos = GtidList::parse(slave_pos);
            ch.catchup_polls = catchup_polls;
        }
    }

    pub fn set_sql_error(&self, channel: &str, error: &str) {
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.last_sql_error = error.to_string();
        }
    }

    pub fn stop_sql_thread(&self, channel: &str) {
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.sql_running = false;
        }
    }

    pub fn set_long_write_threads(&self, count: usize) {
        self.server.state.lock().long_write_threads = count;
    }

    pub fn set_wsrep(&self, local_state: &str, cluster_status: &str) {
        let mut state = self.server.state.lock();
        state.variables.insert("WSREP_ON".into(), "ON".into());
        state
            .status
            .insert("WSREP_LOCAL_STATE".into(), local_state.to_string());
        state
            .status
            .insert("WSREP_CLUSTER_STATUS".into(), cluster_status.to_string());
    }

    pub fn set_seconds_behind(&self, channel: &str, secs: Option<u64>) {
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.seconds_behind = secs;
        }
    }

    // Inspection helpers for assertions.

    pub fn is_read_only(&self) -> bool {
        self.server.state.lock().read_only
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.server.state.lock().channels.contains_key(channel)
    }

    pub fn channel_source(&self, channel: &str) -> Option<(String, u16)> {
        self.server
            .state
            .lock()
            .channels
            .get(channel)
            .map(|ch| (ch.master_host.clone(), ch.master_port))
    }

    pub fn channel_mode(&self, channel: &str) -> Option<MasterUseGtid> {
        self.server
            .state
            .lock()
            .channels
            .get(channel)
            .map(|ch| ch.mode.clone())
    }

    pub fn change_master_count(&self) -> usize {
        self.server.state.lock().change_master_log.len()
    }

    pub fn last_change_master(&self) -> Option<ChangeMasterOpt> {
        self.server.state.lock().change_master_log.last().cloned()
    }

    pub fn killed_thread_batches(&self) -> usize {
        self.server.state.lock().kill_batches
    }

    pub fn long_write_poll_count(&self) -> usize {
        self.server.state.lock().long_write_polls
    }

    pub fn current_gtid(&self) -> GtidList {
        self.server.state.lock().current_gtid.clone()
    }

    pub fn max_connections(&self) -> u64 {
        self.server.state.lock().max_connections
    }

    pub fn client(&self) -> Arc<dyn DatabaseClient> {
        Arc::new(SimClient {
            server: Arc::clone(&self.server),
        })
    }
}

struct SimServer {
    /// Back-reference to the fleet for resolving replication sources.
    fleet: Weak<Mutex<HashMap<String, Arc<SimServer>>>>,
    state: Mutex<SimState>,
}

struct SimChannel {
    master_host: String,
    master_port: u16,
    master_server_id: u64,
    mode: MasterUseGtid,
    io_running: bool,
    sql_running: bool,
    gtid_io_pos: GtidList,
    gtid_slave_pos: GtidList,
    seconds_behind: Option<u64>,
    last_io_error: String,
    last_sql_error: String,
    /// Remaining polls before the SQL position converges on the IO position.
    catchup_polls: u32,
    master_log_file: String,
    read_master_log_pos: u64,
    relay_master_log_file: String,
    exec_master_log_pos: u64,
}

struct SimState {
    host: String,
    port: u16,
    server_id: u64,
    version: ServerVersion,

    reachable: bool,
    auth_fail: bool,
    disk_full: bool,
    no_channel_error: bool,

    variables: HashMap<String, String>,
    status: HashMap<String, String>,
    read_only: bool,
    max_connections: u64,

    binlog_file: String,
    binlog_pos: u64,
    current_gtid: GtidList,

    channels: BTreeMap<String, SimChannel>,
    default_channel: String,

    long_write_threads: usize,
    long_write_polls: usize,
    kill_batches: usize,

    processlist: Vec<ProcessEntry>,
    events: Vec<EventEntry>,
    users: Vec<Grant>,
    plugins: Vec<Plugin>,

    change_master_log: Vec<ChangeMasterOpt>,
}

impl SimState {
    fn new(host: &str, port: u16, version: &str) -> Self {
        let server_id = crate::server::stable_id(host, port) % 4_000_000_000;
        let mut variables = HashMap::new();
        variables.insert("SERVER_ID".to_string(), server_id.to_string());
        variables.insert("READ_ONLY".to_string(), "OFF".to_string());
        variables.insert("LOG_BIN".to_string(), "ON".to_string());
        variables.insert("BINLOG_FORMAT".to_string(), "ROW".to_string());
        variables.insert("GTID_STRICT_MODE".to_string(), "OFF".to_string());
        variables.insert("EVENT_SCHEDULER".to_string(), "ON".to_string());

        let mut status = HashMap::new();
        status.insert("QUERIES".to_string(), "0".to_string());
        status.insert("SLOW_QUERIES".to_string(), "0".to_string());

        Self {
            host: host.to_string(),
            port,
            server_id,
            version: ServerVersion::parse(version),
            reachable: true,
            auth_fail: false,
            disk_full: false,
            no_channel_error: false,
            variables,
            status,
            read_only: false,
            max_connections: 151,
            binlog_file: "mysql-bin.000001".to_string(),
            binlog_pos: 4,
            current_gtid: GtidList::default(),
            channels: BTreeMap::new(),
            default_channel: String::new(),
            long_write_threads: 0,
            long_write_polls: 0,
            kill_batches: 0,
            processlist: Vec::new(),
            events: Vec::new(),
            users: vec![Grant {
                user: "root".to_string(),
                host: "%".to_string(),
            }],
            plugins: Vec::new(),
            change_master_log: Vec::new(),
        }
    }

    fn refresh_derived_variables(&mut self) {
        self.variables.insert(
            "READ_ONLY".to_string(),
            if self.read_only { "ON" } else { "OFF" }.to_string(),
        );
        let gtid = self.current_gtid.to_string();
        self.variables
            .insert("GTID_CURRENT_POS".to_string(), gtid.clone());
        self.variables
            .insert("GTID_BINLOG_POS".to_string(), gtid.clone());
        let slave_gtid = self
            .channels
            .values()
            .next()
            .map(|ch| ch.gtid_slave_pos.to_string())
            .unwrap_or_default();
        self.variables
            .insert("GTID_SLAVE_POS".to_string(), slave_gtid);
        self.variables
            .insert("MAX_CONNECTIONS".to_string(), self.max_connections.to_string());
    }

    fn slave_status_rows(&mut self) -> Vec<SlaveStatus> {
        let mut rows = Vec::new();
        for (name, ch) in self.channels.iter_mut() {
            // Converge lag one step per poll.
            if ch.catchup_polls > 0 {
                ch.catchup_polls -= 1;
                if ch.catchup_polls == 0 {
                    ch.gtid_slave_pos = ch.gtid_io_pos.clone();
                    ch.exec_master_log_pos = ch.read_master_log_pos;
                    ch.relay_master_log_file = ch.master_log_file.clone();
                    ch.seconds_behind = Some(0);
                }
            }
            rows.push(SlaveStatus {
                connection_name: name.clone(),
                master_host: ch.master_host.clone(),
                master_port: ch.master_port,
                master_server_id: ch.master_server_id,
                slave_io_running: ch.io_running,
                slave_sql_running: ch.sql_running,
                seconds_behind_master: ch.seconds_behind,
                master_log_file: ch.master_log_file.clone(),
                read_master_log_pos: ch.read_master_log_pos,
                relay_master_log_file: ch.relay_master_log_file.clone(),
                exec_master_log_pos: ch.exec_master_log_pos,
                last_io_error: ch.last_io_error.clone(),
                last_sql_error: ch.last_sql_error.clone(),
                using_gtid: Some(match ch.mode {
                    MasterUseGtid::SlavePos => UsingGtid::SlavePos,
                    MasterUseGtid::CurrentPos => UsingGtid::CurrentPos,
                    _ => UsingGtid::No,
                }),
                gtid_io_pos: ch.gtid_io_pos.to_string(),
                gtid_slave_pos: ch.gtid_slave_pos.to_string(),
                executed_gtid_set: String::new(),
                slave_sql_running_state: if ch.sql_running {
                    "Slave has read all relay log; waiting for more updates".to_string()
                } else {
                    String::new()
                },
            });
        }
        rows
    }
}

struct SimConnector {
    fleet: SimFleet,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn DatabaseClient>, DbError> {
        let url = format!("{}:{}", host, port);
        let server = self
            .fleet
            .inner
            .lock()
            .get(&url)
            .cloned()
            .ok_or_else(|| DbError::Connection(format!("unknown host {}", url)))?;

        {
            let state = server.state.lock();
            if !state.reachable {
                return Err(DbError::Connection(format!("connection refused {}", url)));
            }
            if state.auth_fail {
                return Err(DbError::AccessDenied);
            }
        }

        Ok(Arc::new(SimClient { server }))
    }
}

struct SimClient {
    server: Arc<SimServer>,
}

impl SimClient {
    fn check_reachable(&self) -> Result<(), DbError> {
        let state = self.server.state.lock();
        if !state.reachable {
            return Err(DbError::Connection("connection lost".to_string()));
        }
        if state.auth_fail {
            return Err(DbError::AccessDenied);
        }
        Ok(())
    }

    /// Resolve the fleet entry for a replication source.
    fn source(&self, host: &str, port: u16) -> Option<Arc<SimServer>> {
        let fleet = self.server.fleet.upgrade()?;
        let url = format!("{}:{}", host, port);
        let entry = fleet.lock().get(&url).cloned();
        entry
    }
}

#[async_trait]
impl DatabaseClient for SimClient {
    async fn ping(&self) -> Result<(), DbError> {
        self.check_reachable()
    }

    async fn get_version(&self) -> Result<ServerVersion, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().version.clone())
    }

    async fn get_variables(&self) -> Result<HashMap<String, String>, DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.refresh_derived_variables();
        Ok(state.variables.clone())
    }

    async fn get_status(&self) -> Result<HashMap<String, String>, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().status.clone())
    }

    async fn get_variable(&self, name: &str) -> Result<String, DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.refresh_derived_variables();
        state
            .variables
            .get(&name.to_uppercase())
            .cloned()
            .ok_or(DbError::NoRows)
    }

    async fn get_master_status(&self) -> Result<MasterStatus, DbError> {
        self.check_reachable()?;
        let state = self.server.state.lock();
        Ok(MasterStatus {
            file: state.binlog_file.clone(),
            position: state.binlog_pos,
        })
    }

    async fn get_binary_logs(&self) -> Result<Vec<String>, DbError> {
        self.check_reachable()?;
        Ok(vec![self.server.state.lock().binlog_file.clone()])
    }

    async fn get_binlog_dump_threads(&self) -> Result<usize, DbError> {
        self.check_reachable()?;
        let state = self.server.state.lock();
        if state.disk_full {
            return Err(DbError::DiskFull);
        }
        Ok(0)
    }

    async fn get_all_slave_status(&self) -> Result<Vec<SlaveStatus>, DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        if state.channels.is_empty() && state.no_channel_error {
            return Err(DbError::NoSuchChannel);
        }
        Ok(state.slave_status_rows())
    }

    async fn get_processlist(&self) -> Result<Vec<ProcessEntry>, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().processlist.clone())
    }

    async fn get_innodb_status(&self) -> Result<String, DbError> {
        self.check_reachable()?;
        Ok("=====================================\nINNODB MONITOR OUTPUT\n=====================================".to_string())
    }

    async fn get_event_status(&self) -> Result<Vec<EventEntry>, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().events.clone())
    }

    async fn get_users(&self) -> Result<Vec<Grant>, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().users.clone())
    }

    async fn get_plugins(&self) -> Result<Vec<Plugin>, DbError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().plugins.clone())
    }

    async fn check_privileges(&self, _user: &str) -> Result<(), DbError> {
        self.check_reachable()
    }

    async fn set_read_only(&self, on: bool) -> Result<(), DbError> {
        self.check_reachable()?;
        self.server.state.lock().read_only = on;
        Ok(())
    }

    async fn flush_tables(&self) -> Result<(), DbError> {
        self.check_reachable()
    }

    async fn reset_master(&self) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.binlog_file = "mysql-bin.000001".to_string();
        state.binlog_pos = 4;
        state.current_gtid = GtidList::default();
        Ok(())
    }

    async fn stop_slave(&self, channel: &str) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.io_running = false;
            ch.sql_running = false;
        }
        Ok(())
    }

    async fn stop_all_slaves(&self) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        for ch in state.channels.values_mut() {
            ch.io_running = false;
            ch.sql_running = false;
        }
        Ok(())
    }

    async fn start_slave(&self, channel: &str) -> Result<(), DbError> {
        self.check_reachable()?;
        // Resolve the source before locking our own state.
        let source_addr = {
            let state = self.server.state.lock();
            state
                .channels
                .get(channel)
                .map(|ch| (ch.master_host.clone(), ch.master_port))
        };
        let source_pos = source_addr.and_then(|(host, port)| {
            self.source(&host, port).map(|src| {
                let s = src.state.lock();
                (s.current_gtid.clone(), s.binlog_file.clone(), s.binlog_pos)
            })
        });

        let mut state = self.server.state.lock();
        let ch = state
            .channels
            .get_mut(channel)
            .ok_or(DbError::NoSuchChannel)?;
        ch.io_running = true;
        ch.sql_running = true;
        if ch.catchup_polls == 0 {
            if let Some((gtid, file, pos)) = source_pos {
                ch.gtid_io_pos = gtid.clone();
                ch.gtid_slave_pos = gtid;
                ch.master_log_file = file.clone();
                ch.relay_master_log_file = file;
                ch.read_master_log_pos = pos;
                ch.exec_master_log_pos = pos;
                ch.seconds_behind = Some(0);
            }
        }
        Ok(())
    }

    async fn reset_slave(&self, channel: &str, all: bool) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        if all {
            state.channels.remove(channel);
        } else if let Some(ch) = state.channels.get_mut(channel) {
            ch.io_running = false;
            ch.sql_running = false;
            ch.last_io_error.clear();
            ch.last_sql_error.clear();
        }
        Ok(())
    }

    async fn set_default_master_conn(&self, channel: &str) -> Result<(), DbError> {
        self.check_reachable()?;
        self.server.state.lock().default_channel = channel.to_string();
        Ok(())
    }

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        let value = gtid.to_string();
        state
            .variables
            .insert("GTID_SLAVE_POS".to_string(), value);
        Ok(())
    }

    async fn change_master(&self, opt: ChangeMasterOpt) -> Result<(), DbError> {
        self.check_reachable()?;
        let master_server_id = self
            .source(&opt.host, opt.port)
            .map(|src| src.state.lock().server_id)
            .unwrap_or(0);

        let mut state = self.server.state.lock();
        let (file, pos) = match &opt.mode {
            MasterUseGtid::Positional { file, pos } => (file.clone(), *pos),
            _ => (String::new(), 0),
        };
        state.channels.insert(
            opt.channel.clone(),
            SimChannel {
                master_host: opt.host.clone(),
                master_port: opt.port,
                master_server_id,
                mode: opt.mode.clone(),
                io_running: false,
                sql_running: false,
                gtid_io_pos: GtidList::default(),
                gtid_slave_pos: GtidList::default(),
                seconds_behind: None,
                last_io_error: String::new(),
                last_sql_error: String::new(),
                catchup_polls: 0,
                master_log_file: file.clone(),
                read_master_log_pos: pos,
                relay_master_log_file: file,
                exec_master_log_pos: pos,
            },
        );
        state.change_master_log.push(opt);
        Ok(())
    }

    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.last_sql_error.clear();
        }
        Ok(())
    }

    async fn long_running_writes(&self, _min_secs: u64) -> Result<usize, DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.long_write_polls += 1;
        Ok(state.long_write_threads)
    }

    async fn kill_threads(&self) -> Result<(), DbError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.long_write_threads = 0;
        state.kill_batches += 1;
        Ok(())
    }

    async fn set_max_connections(&self, value: u64) -> Result<(), DbError> {
        self.check_reachable()?;
        self.server.state.lock().max_connections = value;
        Ok(())
    }

    async fn shutdown_server(&self, _wait_for_slaves: bool) -> Result<(), DbError> {
        self.check_reachable()?;
        self.server.state.lock().reachable = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet_with_pair() -> (SimFleet, SimHandle, SimHandle) {
        let fleet = SimFleet::new();
        let a = fleet.add_server("db1", 3306, "10.5.9-MariaDB-log");
        let b = fleet.add_server("db2", 3306, "10.5.9-MariaDB-log");
        (fleet, a, b)
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let (fleet, _a, _b) = fleet_with_pair();
        let connector = fleet.connector();
        let client = connector
            .connect("db1", 3306, &Credentials::default())
            .await
            .unwrap();
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_and_auth_fail() {
        let (fleet, a, _b) = fleet_with_pair();
        let connector = fleet.connector();

        a.set_unreachable(true);
        let err = connector
            .connect("db1", 3306, &Credentials::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbError::Connection(_)));

        a.set_unreachable(false);
        a.set_auth_fail(true);
        let err = connector
            .connect("db1", 3306, &Credentials::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_change_master_and_start_slave_syncs() {
        let (fleet, a, b) = fleet_with_pair();
        a.advance_gtid(0, 42);

        let client = b.client();
        client
            .change_master(ChangeMasterOpt {
                host: "db1".to_string(),
                port: 3306,
                user: "repl".to_string(),
                password: "repl".to_string(),
                channel: String::new(),
                mode: MasterUseGtid::SlavePos,
                retry: 10,
                heartbeat_secs: 3,
                ssl: false,
                delayed: false,
                delay_secs: 0,
            })
            .await
            .unwrap();
        client.start_slave("").await.unwrap();

        let rows = client.get_all_slave_status().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].threads_running());
        assert_eq!(rows[0].gtid_slave_pos, a.current_gtid().to_string());
        let _ = fleet;
    }

    #[tokio::test]
    async fn test_no_channel_error_mode() {
        let (_fleet, a, _b) = fleet_with_pair();
        a.set_no_channel_error(true);
        let client = a.client();
        assert!(matches!(
            client.get_all_slave_status().await,
            Err(DbError::NoSuchChannel)
        ));
    }

    #[tokio::test]
    async fn test_disk_full_surfaces_on_dump_threads() {
        let (_fleet, a, _b) = fleet_with_pair();
        a.set_disk_full(true);
        let client = a.client();
        assert!(client
            .get_binlog_dump_threads()
            .await
            .unwrap_err()
            .is_disk_full());
    }

    #[tokio::test]
    async fn test_lag_converges_per_poll() {
        let (_fleet, a, b) = fleet_with_pair();
        a.advance_gtid(0, 10);
        let client = b.client();
        client
            .change_master(ChangeMasterOpt {
                host: "db1".to_string(),
                port: 3306,
                user: "repl".to_string(),
                password: "repl".to_string(),
                channel: String::new(),
                mode: MasterUseGtid::SlavePos,
                retry: 10,
                heartbeat_secs: 3,
                ssl: false,
                delayed: false,
                delay_secs: 0,
            })
            .await
            .unwrap();
        b.set_channel_lag("", "0-1-10", "0-1-5", 2);

        let rows = client.get_all_slave_status().await.unwrap();
        assert_ne!(rows[0].gtid_slave_pos, rows[0].gtid_io_pos);
        let rows = client.get_all_slave_status().await.unwrap();
        assert_eq!(rows[0].gtid_slave_pos, rows[0].gtid_io_pos);
    }

    #[tokio::test]
    async fn test_kill_threads_clears_long_writes() {
        let (_fleet, a, _b) = fleet_with_pair();
        a.set_long_write_threads(3);
        let client = a.client();
        assert_eq!(client.long_running_writes(0).await.unwrap(), 3);
        client.kill_threads().await.unwrap();
        assert_eq!(client.long_running_writes(0).await.unwrap(), 0);
        assert_eq!(a.killed_thread_batches(), 1);
    }

    #[tokio::test]
    async fn test_read_only_reflected_in_variables() {
        let (_fleet, a, _b) = fleet_with_pair();
        let client = a.client();
        client.set_read_only(true).await.unwrap();
        let vars = client.get_variables().await.unwrap();
        assert_eq!(vars.get("READ_ONLY").map(String::as_str), Some("ON"));
        assert!(a.is_read_only());
    }
}

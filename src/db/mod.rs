//! Database access layer: the narrow SQL command contract the core
//! consumes.
//!
//! The monitor, bootstrap engine and failover controller never speak SQL
//! directly; they drive a [`DatabaseClient`]. Backends implement the trait
//! over an actual driver ([`mysql`]) or over an in-memory fleet
//! ([`simulator`]) used by the test harness.

pub mod mysql;
pub mod simulator;

use crate::gtid::GtidList;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Credentials;

/// Errors surfaced by a database backend.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// Credentials rejected (MySQL error 1045).
    #[error("access denied")]
    AccessDenied,

    /// A statement that expects rows returned none.
    #[error("query returned no rows")]
    NoRows,

    /// Multi-source replication channel does not exist (MySQL error 1617).
    #[error("no such replication channel")]
    NoSuchChannel,

    /// No space left on device (errno 28).
    #[error("no space left on device")]
    DiskFull,

    /// Could not reach or keep a connection to the server.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Any other server-side error.
    #[error("sql error {code}: {message}")]
    Sql { code: u16, message: String },

    /// The backend does not support this statement (e.g. maxscale binlog
    /// relays reject SHOW VARIABLES).
    #[error("unsupported by backend: {0}")]
    Unsupported(String),
}

impl DbError {
    pub fn is_auth(&self) -> bool {
        matches!(self, DbError::AccessDenied)
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, DbError::DiskFull)
    }
}

/// Server flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    MariaDb,
    MySql,
    Percona,
    Unknown,
}

/// Parsed server version: flavor plus semver triplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub flavor: Flavor,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Raw version string as reported by the server.
    pub source: String,
}

impl ServerVersion {
    pub fn unknown() -> Self {
        Self {
            flavor: Flavor::Unknown,
            major: 0,
            minor: 0,
            patch: 0,
            source: "Unknown-0.0.0".to_string(),
        }
    }

    /// Parse a `SELECT VERSION()` string such as `10.5.9-MariaDB-log`,
    /// `8.0.30` or `5.7.36-39-Percona`.
    pub fn parse(version: &str) -> Self {
        let lower = version.to_ascii_lowercase();
        let flavor = if lower.contains("mariadb") {
            Flavor::MariaDb
        } else if lower.contains("percona") {
            Flavor::Percona
        } else {
            Flavor::MySql
        };

        let numeric: &str = version
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or("");
        let mut parts = numeric.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Self {
            flavor,
            major,
            minor,
            patch,
            source: version.to_string(),
        }
    }

    pub fn is_mariadb(&self) -> bool {
        self.flavor == Flavor::MariaDb
    }

    pub fn is_mysql_or_percona(&self) -> bool {
        matches!(self.flavor, Flavor::MySql | Flavor::Percona)
    }

    pub fn greater_equal(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// GTID positioning mode reported by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsingGtid {
    No,
    SlavePos,
    CurrentPos,
}

impl UsingGtid {
    pub fn from_str_report(s: &str) -> Self {
        match s {
            "Slave_Pos" => UsingGtid::SlavePos,
            "Current_Pos" => UsingGtid::CurrentPos,
            _ => UsingGtid::No,
        }
    }

    pub fn is_gtid(&self) -> bool {
        !matches!(self, UsingGtid::No)
    }
}

impl fmt::Display for UsingGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UsingGtid::No => "No",
            UsingGtid::SlavePos => "Slave_Pos",
            UsingGtid::CurrentPos => "Current_Pos",
        };
        f.write_str(s)
    }
}

/// One replication channel status record (SHOW SLAVE STATUS row).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveStatus {
    /// Channel name; empty for the default channel.
    pub connection_name: String,
    pub master_host: String,
    pub master_port: u16,
    pub master_server_id: u64,
    pub slave_io_running: bool,
    pub slave_sql_running: bool,
    pub seconds_behind_master: Option<u64>,
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub last_io_error: String,
    pub last_sql_error: String,
    pub using_gtid: Option<UsingGtid>,
    pub gtid_io_pos: String,
    pub gtid_slave_pos: String,
    pub executed_gtid_set: String,
    pub slave_sql_running_state: String,
}

impl SlaveStatus {
    /// Find the record for one channel in a multi-source status list.
    pub fn for_channel<'a>(list: &'a [SlaveStatus], channel: &str) -> Option<&'a SlaveStatus> {
        list.iter()
            .find(|s| s.connection_name == channel)
            .or_else(|| if channel.is_empty() { list.first() } else { None })
    }

    pub fn has_replication_error(&self) -> bool {
        !self.last_io_error.is_empty() || !self.last_sql_error.is_empty()
    }

    pub fn threads_running(&self) -> bool {
        self.slave_io_running && self.slave_sql_running
    }
}

impl Default for UsingGtid {
    fn default() -> Self {
        UsingGtid::No
    }
}

/// SHOW MASTER STATUS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
}

/// One processlist entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: u64,
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub command: String,
    pub time_secs: u64,
    pub state: Option<String>,
    pub info: Option<String>,
}

/// One scheduled event entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventEntry {
    pub db: String,
    pub name: String,
    pub definer: String,
    pub status: String,
}

/// One account grant entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grant {
    pub user: String,
    pub host: String,
}

/// One installed plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub status: String,
    pub library: Option<String>,
}

/// Positioning style for CHANGE MASTER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterUseGtid {
    /// MariaDB `MASTER_USE_GTID=slave_pos`.
    SlavePos,
    /// MariaDB `MASTER_USE_GTID=current_pos`.
    CurrentPos,
    /// MySQL `MASTER_AUTO_POSITION=1`.
    AutoPosition,
    /// Binlog file + offset.
    Positional { file: String, pos: u64 },
}

/// Everything needed to issue a CHANGE MASTER statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMasterOpt {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Replication channel name; empty for the default channel.
    pub channel: String,
    pub mode: MasterUseGtid,
    pub retry: u32,
    pub heartbeat_secs: u32,
    pub ssl: bool,
    pub delayed: bool,
    pub delay_secs: u32,
}

/// The SQL command contract. One client per live server connection.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn ping(&self) -> Result<(), DbError>;
    async fn get_version(&self) -> Result<ServerVersion, DbError>;

    /// SHOW GLOBAL VARIABLES, keys uppercased.
    async fn get_variables(&self) -> Result<HashMap<String, String>, DbError>;
    /// SHOW GLOBAL STATUS, keys uppercased.
    async fn get_status(&self) -> Result<HashMap<String, String>, DbError>;
    async fn get_variable(&self, name: &str) -> Result<String, DbError>;

    async fn get_master_status(&self) -> Result<MasterStatus, DbError>;
    async fn get_binary_logs(&self) -> Result<Vec<String>, DbError>;
    async fn get_binlog_dump_threads(&self) -> Result<usize, DbError>;

    /// All replication channel records. An empty list means no replication
    /// is configured; [`DbError::NoSuchChannel`] is the multi-source variant
    /// of the same answer.
    async fn get_all_slave_status(&self) -> Result<Vec<SlaveStatus>, DbError>;

    async fn get_processlist(&self) -> Result<Vec<ProcessEntry>, DbError>;
    async fn get_innodb_status(&self) -> Result<String, DbError>;
    async fn get_event_status(&self) -> Result<Vec<EventEntry>, DbError>;
    async fn get_users(&self) -> Result<Vec<Grant>, DbError>;
    async fn get_plugins(&self) -> Result<Vec<Plugin>, DbError>;
    async fn check_privileges(&self, user: &str) -> Result<(), DbError>;

    async fn set_read_only(&self, on: bool) -> Result<(), DbError>;
    async fn flush_tables(&self) -> Result<(), DbError>;
    async fn reset_master(&self) -> Result<(), DbError>;

    async fn stop_slave(&self, channel: &str) -> Result<(), DbError>;
    async fn stop_all_slaves(&self) -> Result<(), DbError>;
    async fn start_slave(&self, channel: &str) -> Result<(), DbError>;
    async fn reset_slave(&self, channel: &str, all: bool) -> Result<(), DbError>;
    async fn set_default_master_conn(&self, channel: &str) -> Result<(), DbError>;
    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError>;
    async fn change_master(&self, opt: ChangeMasterOpt) -> Result<(), DbError>;
    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError>;

    /// Count of write statements running longer than `min_secs`.
    async fn long_running_writes(&self, min_secs: u64) -> Result<usize, DbError>;
    async fn kill_threads(&self) -> Result<(), DbError>;
    async fn set_max_connections(&self, value: u64) -> Result<(), DbError>;

    async fn shutdown_server(&self, wait_for_slaves: bool) -> Result<(), DbError>;
}

/// Opens [`DatabaseClient`] connections for declared servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Arc<dyn DatabaseClient>, DbError>;
}

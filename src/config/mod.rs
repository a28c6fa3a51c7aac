//! Configuration module for repman.

use crate::error::{RepmanError, Result};
use crate::orchestrator::OrchestratorKind;
use crate::topology::TopologyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for one managed cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster identity and declared fleet.
    pub cluster: ClusterConfig,
    /// Monitoring cadence and probe settings.
    pub monitoring: MonitoringConfig,
    /// Replication channel and credentials.
    pub replication: ReplicationConfig,
    /// Topology selection and host roles.
    pub topology: TopologyConfig,
    /// Failover and switchover pacing.
    pub failover: FailoverConfig,
    /// Orchestrator selection.
    pub provisioning: ProvisioningConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RepmanError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RepmanError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.is_empty() {
            return Err(RepmanError::InvalidConfig {
                field: "cluster.name".to_string(),
                reason: "Cluster name must not be empty".to_string(),
            });
        }

        if self.cluster.servers.is_empty() {
            return Err(RepmanError::InvalidConfig {
                field: "cluster.servers".to_string(),
                reason: "At least one database server must be declared".to_string(),
            });
        }

        for url in &self.cluster.servers {
            if split_host_port(url).is_none() {
                return Err(RepmanError::InvalidConfig {
                    field: "cluster.servers".to_string(),
                    reason: format!("Invalid host:port entry: {}", url),
                });
            }
        }

        if self.monitoring.max_fail == 0 {
            return Err(RepmanError::InvalidConfig {
                field: "monitoring.max_fail".to_string(),
                reason: "max_fail must be at least 1".to_string(),
            });
        }

        let exclusive_topologies = [
            self.topology.multi_master,
            self.topology.multi_master_ring,
            self.topology.multi_master_wsrep,
            self.topology.multi_tier_slave,
            self.topology.mxs_binlog,
        ]
        .iter()
        .filter(|&&flag| flag)
        .count();
        if exclusive_topologies > 1 {
            return Err(RepmanError::InvalidConfig {
                field: "topology".to_string(),
                reason: "At most one topology flag may be set".to_string(),
            });
        }

        if self.topology.multi_master && self.cluster.servers.len() < 2 {
            return Err(RepmanError::InvalidConfig {
                field: "topology.multi_master".to_string(),
                reason: "Two-node multi-master requires at least two servers".to_string(),
            });
        }

        Ok(())
    }

    /// The topology kind derived from configuration flags.
    pub fn topology_kind(&self) -> TopologyKind {
        if self.topology.multi_master_wsrep {
            TopologyKind::MultiMasterWsrep
        } else if self.topology.multi_master_ring {
            TopologyKind::MultiMasterRing
        } else if self.topology.multi_master {
            TopologyKind::MultiMaster2Node
        } else if self.topology.multi_tier_slave {
            TopologyKind::MultiTierSlave
        } else if self.topology.mxs_binlog {
            TopologyKind::MaxscaleBinlog
        } else {
            TopologyKind::MasterSlave
        }
    }

    pub fn is_preferred(&self, url: &str) -> bool {
        self.topology
            .pref_master
            .as_deref()
            .map(|p| p == url)
            .unwrap_or(false)
    }

    pub fn is_preferred_backup(&self, url: &str) -> bool {
        self.topology
            .preferred_backup_hosts
            .iter()
            .any(|h| h == url)
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        self.topology.ignored_hosts.iter().any(|h| h == url)
    }

    pub fn is_ignored_readonly(&self, url: &str) -> bool {
        self.topology.ignored_readonly.iter().any(|h| h == url)
    }

    pub fn is_delayed(&self, url: &str) -> bool {
        self.replication.hosts_delayed.iter().any(|h| h == url)
    }

    /// Create a minimal development configuration over a localhost fleet.
    pub fn development() -> Self {
        Self {
            cluster: ClusterConfig {
                name: "dev".to_string(),
                servers: vec![
                    "127.0.0.1:3306".to_string(),
                    "127.0.0.1:3307".to_string(),
                    "127.0.0.1:3308".to_string(),
                ],
                proxies: vec![],
                working_dir: PathBuf::from("/tmp/repman"),
            },
            monitoring: MonitoringConfig::default(),
            replication: ReplicationConfig::default(),
            topology: TopologyConfig::default(),
            failover: FailoverConfig::default(),
            provisioning: ProvisioningConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Cluster identity and declared fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; prefixes service names and the working directory.
    pub name: String,
    /// Declared database servers as host:port. Order is significant:
    /// index 0 is the default master in bootstrap.
    pub servers: Vec<String>,
    /// Declared proxies as host:port.
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Working directory for per-server state, cookies and captures.
    pub working_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            servers: Vec::new(),
            proxies: Vec::new(),
            working_dir: PathBuf::from("/var/lib/repman"),
        }
    }
}

/// Probe mode for the per-server connectivity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Open a fresh database connection.
    Tcp,
    /// HTTP GET against the server side-car agent.
    Agent,
}

/// Monitoring cadence and probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Interval between monitoring ticks.
    #[serde(with = "duration_serde")]
    pub ticker: Duration,
    /// Probe mode.
    pub check_type: CheckType,
    /// Consecutive failed probes before a server is declared Failed.
    pub max_fail: u32,
    /// Side-car agent port for `CheckType::Agent`.
    pub agent_port: u16,
    /// Collect the full processlist on refresh.
    pub processlist: bool,
    /// Collect SHOW ENGINE INNODB STATUS on refresh.
    pub innodb_status: bool,
    /// Refresh installed plugins (every 60 ticks).
    pub plugins: bool,
    /// Slow-query delta per tick above which WARN0088 is raised.
    pub slow_query_threshold: u64,
    /// Capture artifacts kept per server before purge.
    pub capture_file_keep: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            ticker: Duration::from_secs(2),
            check_type: CheckType::Tcp,
            max_fail: 5,
            agent_port: 10001,
            processlist: true,
            innodb_status: true,
            plugins: true,
            slow_query_threshold: 20,
            capture_file_keep: 5,
        }
    }
}

/// Database and replication credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Replication channel and CHANGE MASTER knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication channel name used in all CHANGE MASTER / START SLAVE calls.
    pub master_conn: String,
    /// Monitoring credentials.
    pub monitor_credentials: Credentials,
    /// Replication credentials written into CHANGE MASTER.
    pub credentials: Credentials,
    /// Never use GTID positioning even when available.
    pub force_slave_no_gtid: bool,
    /// Require TLS on the replication channel.
    pub ssl: bool,
    /// MASTER_CONNECT_RETRY seconds.
    pub heartbeat_retry: u32,
    /// MASTER_HEARTBEAT_PERIOD seconds.
    pub heartbeat_time: u32,
    /// Hosts replicating with an intentional delay.
    #[serde(default)]
    pub hosts_delayed: Vec<String>,
    /// MASTER_DELAY seconds for delayed hosts.
    pub hosts_delayed_time: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            master_conn: String::new(),
            monitor_credentials: Credentials::default(),
            credentials: Credentials::default(),
            force_slave_no_gtid: false,
            ssl: false,
            heartbeat_retry: 10,
            heartbeat_time: 3,
            hosts_delayed: Vec::new(),
            hosts_delayed_time: 0,
        }
    }
}

/// Topology selection and per-host roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Two-node active-active topology.
    pub multi_master: bool,
    /// Cyclic ring topology.
    pub multi_master_ring: bool,
    /// Synchronous multi-master (wsrep/Galera); replication is not wired.
    pub multi_master_wsrep: bool,
    /// Master, one relay, leaf slaves.
    pub multi_tier_slave: bool,
    /// Maxscale binlog relay topology.
    pub mxs_binlog: bool,
    /// Preferred master host:port for bootstrap and failover.
    pub pref_master: Option<String>,
    /// Hosts excluded from the slaves list and candidate election.
    #[serde(default)]
    pub ignored_hosts: Vec<String>,
    /// Hosts preferred as backup sources.
    #[serde(default)]
    pub preferred_backup_hosts: Vec<String>,
    /// Enforce read-only on every non-master by default.
    pub read_only: bool,
    /// Hosts exempt from the read-only discipline.
    #[serde(default)]
    pub ignored_readonly: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            multi_master: false,
            multi_master_ring: false,
            multi_master_wsrep: false,
            multi_tier_slave: false,
            mxs_binlog: false,
            pref_master: None,
            ignored_hosts: Vec::new(),
            preferred_backup_hosts: Vec::new(),
            read_only: true,
            ignored_readonly: Vec::new(),
        }
    }
}

/// Whether failover fires automatically on master failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    Automatic,
    Manual,
}

/// Failover and switchover pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub mode: FailoverMode,
    /// Budget for draining long-running writes on the demoted master,
    /// polled at 500 ms granularity.
    #[serde(with = "duration_serde")]
    pub switch_wait_kill: Duration,
    /// Reduce max_connections on the demoted master during switchover.
    pub switch_decrease_max_conn: bool,
    /// Value applied when `switch_decrease_max_conn` is set.
    pub switch_decrease_max_conn_value: u64,
    /// Re-attach returning servers automatically.
    pub autorejoin: bool,
    /// Seconds behind master above which a slave classifies as late.
    pub max_delay: u64,
    /// External script invoked on slave replication errors
    /// (args: URL, previous state, new state).
    pub replication_error_script: Option<PathBuf>,
    /// When the last SQL error matches, skip one event and restart the
    /// slave thread.
    pub replication_restart_on_sql_error_match: Option<String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            mode: FailoverMode::Manual,
            switch_wait_kill: Duration::from_millis(10_000),
            switch_decrease_max_conn: false,
            switch_decrease_max_conn_value: 10,
            autorejoin: true,
            max_delay: 30,
            replication_error_script: None,
            replication_restart_on_sql_error_match: None,
        }
    }
}

/// Orchestrator selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Which orchestrator adapter provisions database and proxy services.
    pub orchestrator: OrchestratorKind,
    /// Base URL of the orchestrator agent for the HTTP-backed adapters.
    pub agent_url: Option<String>,
    /// Script directory for the localhost adapter.
    pub scripts_dir: Option<PathBuf>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorKind::Unconfigured,
            agent_url: None,
            scripts_dir: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter.
    pub log_level: String,
    /// Emit JSON logs.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Split a `host:port` string.
pub fn split_host_port(url: &str) -> Option<(String, u16)> {
    let (host, port) = url.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Serde glue for duration fields. Config files write `"2s"`, `"500ms"`,
/// `"5m"` or `"1h"`; a bare number counts milliseconds. Whole seconds
/// serialize as `"Ns"`, anything finer as `"Nms"`.
pub mod duration_serde {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = duration.as_millis();
        let text = if ms % 1000 == 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| D::Error::custom(format!("bad duration {:?}", text)))
    }

    pub(super) fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits.parse().ok()?;
        let unit_ms: u64 = match unit {
            "" | "ms" => 1,
            "s" => 1000,
            "m" => 60 * 1000,
            "h" => 60 * 60 * 1000,
            _ => return None,
        };
        Some(Duration::from_millis(value.checked_mul(unit_ms)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        let config = Config::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.topology_kind(), TopologyKind::MasterSlave);
    }

    #[test]
    fn test_empty_servers_rejected() {
        let mut config = Config::development();
        config.cluster.servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_host_port_rejected() {
        let mut config = Config::development();
        config.cluster.servers = vec!["not-a-url".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exclusive_topology_flags() {
        let mut config = Config::development();
        config.topology.multi_master_ring = true;
        config.topology.multi_tier_slave = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topology_kind_priority() {
        let mut config = Config::development();
        assert_eq!(config.topology_kind(), TopologyKind::MasterSlave);
        config.topology.multi_tier_slave = true;
        assert_eq!(config.topology_kind(), TopologyKind::MultiTierSlave);
        config.topology.multi_tier_slave = false;
        config.topology.multi_master_wsrep = true;
        assert_eq!(config.topology_kind(), TopologyKind::MultiMasterWsrep);
    }

    #[test]
    fn test_host_role_lookups() {
        let mut config = Config::development();
        config.topology.pref_master = Some("127.0.0.1:3307".to_string());
        config.topology.ignored_hosts = vec!["127.0.0.1:3308".to_string()];
        config.replication.hosts_delayed = vec!["127.0.0.1:3308".to_string()];
        assert!(config.is_preferred("127.0.0.1:3307"));
        assert!(!config.is_preferred("127.0.0.1:3306"));
        assert!(config.is_ignored("127.0.0.1:3308"));
        assert!(config.is_delayed("127.0.0.1:3308"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("db1:3306"),
            Some(("db1".to_string(), 3306))
        );
        assert!(split_host_port("db1").is_none());
        assert!(split_host_port(":3306").is_none());
        assert!(split_host_port("db1:notaport").is_none());
    }

    #[test]
    fn test_duration_roundtrip() {
        let config = Config::development();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.monitoring.ticker, config.monitoring.ticker);
        assert_eq!(back.failover.switch_wait_kill, config.failover.switch_wait_kill);
    }

    #[test]
    fn test_duration_parse_units() {
        assert_eq!(duration_serde::parse("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(duration_serde::parse("2s"), Some(Duration::from_secs(2)));
        assert_eq!(duration_serde::parse("5m"), Some(Duration::from_secs(300)));
        assert_eq!(duration_serde::parse("1h"), Some(Duration::from_secs(3600)));
        // Bare numbers count milliseconds.
        assert_eq!(duration_serde::parse(" 250 "), Some(Duration::from_millis(250)));
        assert_eq!(duration_serde::parse("2d"), None);
        assert_eq!(duration_serde::parse("fast"), None);
        assert_eq!(duration_serde::parse(""), None);
    }
}

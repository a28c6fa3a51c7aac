//! Per-tick server refresh: variables, status, replication records and
//! feature flags, with cadence-gated extra work.

use crate::cluster::Cluster;
use crate::db::{DbError, SlaveStatus};
use crate::gtid::{GtidList, MysqlGtidSet};
use crate::server::ServerState;
use crate::state::ErrorLevel;
use crate::topology::TopologyKind;
use tracing::{debug, warn};

/// Refresh one server through its persistent handle.
///
/// Individual query failures inside the refresh are logged and surfaced as
/// sticky codes without aborting the tick; only connection-level failures
/// propagate so the monitor can swap the handle.
pub async fn refresh(cluster: &Cluster, idx: usize) -> Result<(), DbError> {
    let mut server = cluster.servers[idx].write().await;
    let conn = match server.conn.clone() {
        Some(conn) => conn,
        None => return Err(DbError::Connection("no persistent handle".to_string())),
    };
    let url = server.url.clone();

    conn.ping().await?;

    let version = conn.get_version().await?;
    // A maxscale binlog relay rejects SHOW VARIABLES; restrict probing.
    if cluster.conf.topology.mxs_binlog
        && version.source.to_ascii_lowercase().contains("maxscale")
    {
        server.is_maxscale = true;
        server.is_relay = true;
        server.state = ServerState::Relay;
        server.version = version;
        return Ok(());
    }
    server.is_maxscale = false;
    server.version = version;

    server.prev_monitor_time = server.monitor_time;
    server.monitor_time = chrono::Utc::now().timestamp();

    let variables = match conn.get_variables().await {
        Ok(vars) => vars,
        Err(e @ DbError::Connection(_)) => return Err(e),
        Err(e) => {
            warn!(server = %url, error = %e, "Could not get database variables");
            return Ok(());
        }
    };

    server.have_read_only = variables.contains_key("READ_ONLY");
    server.read_only = variables.get("READ_ONLY").map(String::as_str) == Some("ON");
    server.have_binlog = variables.get("LOG_BIN").map(String::as_str) == Some("ON");
    server.have_binlog_row = variables.get("BINLOG_FORMAT").map(String::as_str) == Some("ROW");
    server.have_event_scheduler =
        variables.get("EVENT_SCHEDULER").map(String::as_str) == Some("ON");
    server.have_gtid_strict_mode =
        variables.get("GTID_STRICT_MODE").map(String::as_str) == Some("ON");
    server.have_wsrep = variables.get("WSREP_ON").map(String::as_str) == Some("ON");
    server.have_mysql_gtid = variables.get("GTID_MODE").map(String::as_str) == Some("ON");
    if let Some(sid) = variables.get("SERVER_ID").and_then(|v| v.parse().ok()) {
        server.server_id = sid;
    }

    if server.version.is_mariadb() {
        server.gtid_binlog_pos =
            GtidList::parse(variables.get("GTID_BINLOG_POS").map(String::as_str).unwrap_or(""));
        server.current_gtid =
            GtidList::parse(variables.get("GTID_CURRENT_POS").map(String::as_str).unwrap_or(""));
        server.slave_gtid =
            GtidList::parse(variables.get("GTID_SLAVE_POS").map(String::as_str).unwrap_or(""));
    } else {
        server.executed_gtid_set =
            MysqlGtidSet::parse(variables.get("GTID_EXECUTED").map(String::as_str).unwrap_or(""))
                .to_string();
    }
    server.variables = variables;

    match conn.get_event_status().await {
        Ok(events) => server.event_status = events,
        Err(e) => {
            debug!(server = %url, error = %e, "Could not get events status");
            cluster.sme.set_state(
                "ERR00073",
                ErrorLevel::Err,
                "MON",
                format!("Could not get event status on {}", url),
                Some(url.clone()),
            );
        }
    }

    // Privileges are re-checked on a slow cadence.
    if cluster.sme.heartbeats() % 30 == 0 {
        if let Err(e) = conn
            .check_privileges(&cluster.conf.replication.monitor_credentials.user)
            .await
        {
            warn!(server = %url, error = %e, "Privilege check failed");
        }
    }

    if let Ok(users) = conn.get_users().await {
        server.users = users;
    }

    if cluster.conf.monitoring.processlist {
        match conn.get_processlist().await {
            Ok(list) => server.process_list = list,
            Err(e) => {
                cluster.sme.set_state(
                    "ERR00075",
                    ErrorLevel::Err,
                    "MON",
                    format!("Could not get processlist: {}", e),
                    Some(url.clone()),
                );
            }
        }
    }

    if server.in_capture_mode {
        cluster.sme.set_state(
            "WARN0085",
            ErrorLevel::Info,
            "MON",
            format!("Capture mode is on for server {}", url),
            Some(url.clone()),
        );
    }

    // SHOW MASTER STATUS; the binary log may be closed on this server.
    if let Ok(master_status) = conn.get_master_status().await {
        let rotated = !server.binlog_file_previous.is_empty()
            && server.binlog_file_previous != master_status.file;
        if rotated {
            if let Ok(logs) = conn.get_binary_logs().await {
                server.binary_logs = logs;
            }
        }
        server.binlog_file_previous = master_status.file.clone();
        server.master_status = master_status;
    }

    match conn.get_binlog_dump_threads().await {
        Ok(count) => {
            server.is_full = false;
            server.binlog_dump_threads = count;
        }
        Err(e) if e.is_disk_full() => {
            server.is_full = true;
            cluster.sme.set_state(
                "WARN0100",
                ErrorLevel::Warn,
                "CONF",
                format!("No space left on device on {}: {}", url, e),
                Some(url.clone()),
            );
            // Suppress the rest of the refresh for this tick.
            return Ok(());
        }
        Err(e) => {
            cluster.sme.set_state(
                "ERR00014",
                ErrorLevel::Err,
                "CONF",
                format!("Could not get binlog dump threads on {}: {}", url, e),
                Some(url.clone()),
            );
        }
    }

    if cluster.conf.monitoring.innodb_status {
        if let Ok(status) = conn.get_innodb_status().await {
            server.innodb_status = status;
        }
    }

    // SHOW [ALL] SLAVE[S] STATUS. Channel absence arrives either as an
    // empty result set or as the multi-source no-such-channel error.
    server.replications = match conn.get_all_slave_status().await {
        Ok(rows) => rows,
        Err(DbError::NoSuchChannel) | Err(DbError::NoRows) => Vec::new(),
        Err(e @ DbError::Connection(_)) => return Err(e),
        Err(e) => {
            debug!(server = %url, error = %e, "Could not get slave status");
            Vec::new()
        }
    };

    let channel = server.replication_source_name.clone();
    let slave_status = SlaveStatus::for_channel(&server.replications, &channel).cloned();
    match &slave_status {
        Some(ss) => {
            server.is_slave = true;
            server.have_mariadb_gtid = ss
                .using_gtid
                .map(|mode| mode.is_gtid())
                .unwrap_or(false);
            if server.version.is_mariadb() {
                server.io_gtid = GtidList::parse(&ss.gtid_io_pos);
                if !ss.gtid_slave_pos.is_empty() {
                    server.slave_gtid = GtidList::parse(&ss.gtid_slave_pos);
                }
            } else if !ss.executed_gtid_set.is_empty() {
                server.executed_gtid_set = MysqlGtidSet::parse(&ss.executed_gtid_set).to_string();
            }
        }
        None => {
            server.is_slave = false;
        }
    }

    // Status counters, semi-sync and wsrep observation.
    if let Ok(status) = conn.get_status().await {
        server.prev_status = std::mem::replace(&mut server.status, status);

        let get = |server: &super::ServerMonitor, key: &str| -> String {
            server.status.get(key).cloned().unwrap_or_default()
        };
        let semi_master = get(&server, "RPL_SEMI_SYNC_MASTER_STATUS");
        let semi_slave = get(&server, "RPL_SEMI_SYNC_SLAVE_STATUS");
        server.have_semi_sync = !(semi_master.is_empty() || semi_slave.is_empty());
        server.semi_sync_master_status = semi_master == "ON";
        server.semi_sync_slave_status = semi_slave == "ON";

        server.is_wsrep_sync = get(&server, "WSREP_LOCAL_STATE") == "4";
        server.is_wsrep_donor = get(&server, "WSREP_LOCAL_STATE") == "2";
        server.is_wsrep_primary = get(&server, "WSREP_CLUSTER_STATUS") == "PRIMARY";

        if !server.prev_status.is_empty() && server.monitor_time > server.prev_monitor_time {
            let qps: i64 = get(&server, "QUERIES").parse().unwrap_or(0);
            let prev_qps: i64 = server
                .prev_status
                .get("QUERIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            server.qps = (qps - prev_qps) / (server.monitor_time - server.prev_monitor_time);
        }

        let slow: u64 = get(&server, "SLOW_QUERIES").parse().unwrap_or(0);
        let prev_slow: u64 = server
            .prev_status
            .get("SLOW_QUERIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(slow);
        if slow.saturating_sub(prev_slow) > cluster.conf.monitoring.slow_query_threshold {
            cluster.sme.set_state(
                "WARN0088",
                ErrorLevel::Info,
                "MON",
                format!("High number of slow queries on {}", url),
                Some(url.clone()),
            );
        }
    }

    // Plugin inventory on a slow cadence.
    if cluster.conf.monitoring.plugins && cluster.sme.heartbeats() % 60 == 0 {
        if let Ok(plugins) = conn.get_plugins().await {
            server.plugins = plugins;
        }
    }

    classify(cluster, &mut server, slave_status.as_ref());

    Ok(())
}

/// Derive the server state from the refreshed attributes. Master and relay
/// promotion belong to topology discovery; the refresh classifies slave,
/// wsrep and maintenance states.
fn classify(
    cluster: &Cluster,
    server: &mut super::ServerMonitor,
    slave_status: Option<&SlaveStatus>,
) {
    if server.is_maintenance {
        server.state = ServerState::Maintenance;
        return;
    }

    if server.have_wsrep && cluster.conf.topology_kind() == TopologyKind::MultiMasterWsrep {
        server.state = if server.is_wsrep_donor {
            ServerState::WsrepDonor
        } else if server.is_wsrep_sync {
            ServerState::Wsrep
        } else {
            ServerState::WsrepUnsync
        };
        return;
    }

    let Some(ss) = slave_status else {
        return;
    };
    // Never reclassify an elected master (ring masters replicate too), nor
    // a server the failure path owns.
    if matches!(
        server.state,
        ServerState::Master
            | ServerState::MasterAlone
            | ServerState::Failed
            | ServerState::ErrorAuth
    ) {
        return;
    }

    let relay = server.is_relay;
    let broken = !ss.slave_io_running || !ss.slave_sql_running || ss.has_replication_error();
    let late = ss
        .seconds_behind_master
        .map(|secs| secs > cluster.conf.failover.max_delay)
        .unwrap_or(false);

    server.state = match (relay, broken, late) {
        (false, true, _) => ServerState::SlaveErr,
        (false, false, true) => ServerState::SlaveLate,
        (false, false, false) => ServerState::Slave,
        (true, true, _) => ServerState::RelayErr,
        (true, false, true) => ServerState::RelayLate,
        (true, false, false) => ServerState::Relay,
    };
}

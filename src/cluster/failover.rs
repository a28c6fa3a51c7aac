//! Failover and switchover: freeze the outgoing master, drain the
//! candidate's relay logs, promote, reparent, and re-attach returning
//! servers.

use crate::cluster::bootstrap::{change_master_to, ChangeMasterMode};
use crate::cluster::Cluster;
use crate::error::{RepmanError, Result};
use crate::events::{Event, EventType};
use crate::gtid::GtidList;
use crate::server::ServerState;
use crate::state::FailoverGate;
use crate::topology::TopologyPointers;
use std::time::Duration;
use tracing::{info, warn};

/// Poll period for drain loops.
const DRAIN_POLL: Duration = Duration::from_millis(500);
/// Upper bound on relay-log drain polls.
const DRAIN_MAX_POLLS: u32 = 1200;

/// Planned switchover: demote the live master, promote the best slave.
/// Aborts on the first failure; the gate is released on every return path.
pub async fn switchover(cluster: &Cluster) -> Result<()> {
    let _gate = FailoverGate::acquire(&cluster.sme)?;

    let old_master = cluster.master_index().await.ok_or(RepmanError::NoMaster)?;
    cluster
        .events
        .publish(Event::new(
            EventType::SwitchoverStarted,
            &cluster.name,
            None,
            "Switchover started",
        ))
        .await;

    freeze(cluster, old_master).await?;

    let candidate = elect_candidate(cluster, Some(old_master)).await?;
    read_all_relay_logs(cluster, candidate).await?;
    promote(cluster, candidate).await?;

    // Reparent the remaining slaves, the demoted master included.
    let slaves = cluster.slave_indices().await;
    let mut new_slaves = Vec::new();
    for idx in slaves.into_iter().filter(|&idx| idx != candidate) {
        if let Err(e) = reparent(cluster, idx, candidate).await {
            warn!(cluster = %cluster.name, slave = idx, error = %e, "Could not reparent slave");
        } else {
            new_slaves.push(idx);
        }
    }
    match reparent(cluster, old_master, candidate).await {
        Ok(()) => {
            new_slaves.push(old_master);
            let mut server = cluster.servers[old_master].write().await;
            server.state = ServerState::Slave;
            server.prev_state = ServerState::Slave;
            if let Some(conn) = server.conn.clone() {
                let _ = conn.set_read_only(true).await;
            }
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "Could not reparent demoted master");
        }
    }

    cluster
        .set_pointers(TopologyPointers {
            master: Some(candidate),
            vmaster: None,
            slaves: new_slaves,
        })
        .await;

    cluster
        .events
        .publish(Event::new(
            EventType::SwitchoverCompleted,
            &cluster.name,
            None,
            "Switchover completed",
        ))
        .await;
    Ok(())
}

/// Reactive failover: the old master is unreachable, so the freeze step is
/// skipped.
pub async fn master_failover(cluster: &Cluster) -> Result<()> {
    let _gate = FailoverGate::acquire(&cluster.sme)?;

    let old_master = cluster.master_index().await.ok_or(RepmanError::NoMaster)?;
    cluster
        .events
        .publish(Event::new(
            EventType::FailoverStarted,
            &cluster.name,
            None,
            "Failover started",
        ))
        .await;

    let candidate = elect_candidate(cluster, Some(old_master)).await?;
    read_all_relay_logs(cluster, candidate).await?;
    promote(cluster, candidate).await?;

    let slaves = cluster.slave_indices().await;
    let mut new_slaves = Vec::new();
    for idx in slaves
        .into_iter()
        .filter(|&idx| idx != candidate && idx != old_master)
    {
        if let Err(e) = reparent(cluster, idx, candidate).await {
            warn!(cluster = %cluster.name, slave = idx, error = %e, "Could not reparent slave");
        } else {
            new_slaves.push(idx);
        }
    }

    cluster
        .set_pointers(TopologyPointers {
            master: Some(candidate),
            vmaster: None,
            slaves: new_slaves,
        })
        .await;

    let new_master_url = cluster.servers[candidate].read().await.url.clone();
    cluster
        .events
        .publish(Event::new(
            EventType::FailoverCompleted,
            &cluster.name,
            Some(new_master_url),
            "Failover completed",
        ))
        .await;
    Ok(())
}

/// Candidate selection: preferred first, then the most advanced GTID
/// position; ignored, maintenance, delayed and failed hosts are excluded.
pub async fn elect_candidate(cluster: &Cluster, exclude: Option<usize>) -> Result<usize> {
    let slaves = cluster.slave_indices().await;
    let mut best: Option<(bool, u64, usize)> = None;

    for idx in slaves {
        if Some(idx) == exclude {
            continue;
        }
        let server = cluster.servers[idx].read().await;
        if server.is_failed()
            || server.ignored
            || server.is_maintenance
            || server.is_delayed
            || server.conn.is_none()
        {
            continue;
        }
        let rank = (server.prefered, server.slave_gtid.seq_total(), idx);
        let better = match &best {
            None => true,
            Some((pref, seq, _)) => {
                (rank.0, rank.1) > (*pref, *seq)
            }
        };
        if better {
            best = Some(rank);
        }
    }

    best.map(|(_, _, idx)| idx).ok_or(RepmanError::NoCandidate)
}

/// Freeze the outgoing master: set read-only, wait (bounded) for long
/// writes to drain, cache and optionally reduce max_connections, then kill
/// the stragglers.
pub async fn freeze(cluster: &Cluster, idx: usize) -> Result<()> {
    let (conn, url) = {
        let server = cluster.servers[idx].read().await;
        (server.conn()?, server.url.clone())
    };

    conn.set_read_only(true).await?;

    let mut budget_ms = cluster.conf.failover.switch_wait_kill.as_millis() as i64;
    while budget_ms > 0 {
        let threads = conn.long_running_writes(0).await.unwrap_or(0);
        if threads == 0 {
            break;
        }
        info!(
            cluster = %cluster.name,
            "Waiting for {} write threads to complete on {}",
            threads,
            url
        );
        tokio::time::sleep(DRAIN_POLL).await;
        budget_ms -= DRAIN_POLL.as_millis() as i64;
    }

    match conn.get_variable("MAX_CONNECTIONS").await {
        Ok(value) => {
            let saved = value.parse().ok();
            cluster.servers[idx].write().await.max_conn_saved = saved;
            if cluster.conf.failover.switch_decrease_max_conn {
                if let Err(e) = conn
                    .set_max_connections(cluster.conf.failover.switch_decrease_max_conn_value)
                    .await
                {
                    warn!(server = %url, error = %e, "Could not reduce max_connections on demoted leader");
                }
            }
        }
        Err(e) => {
            warn!(server = %url, error = %e, "Could not get max_connections on demoted leader");
        }
    }

    info!(cluster = %cluster.name, "Terminating all threads on {}", url);
    conn.kill_threads().await?;
    Ok(())
}

/// Wait until the candidate has consumed all relay logs. MariaDB with GTID
/// polls for `Gtid_Slave_Pos == Gtid_IO_Pos`; other flavors poll the binlog
/// file/offset pair or the SQL thread's "read all relay log" report.
pub async fn read_all_relay_logs(cluster: &Cluster, idx: usize) -> Result<()> {
    let (conn, url, channel, mariadb_gtid) = {
        let server = cluster.servers[idx].read().await;
        (
            server.conn()?,
            server.url.clone(),
            server.replication_source_name.clone(),
            server.version.is_mariadb() && server.have_mariadb_gtid,
        )
    };
    info!(cluster = %cluster.name, "Reading all relay logs on {}", url);

    for _ in 0..DRAIN_MAX_POLLS {
        let rows = conn.get_all_slave_status().await?;
        let Some(ss) = crate::db::SlaveStatus::for_channel(&rows, &channel) else {
            return Ok(());
        };

        if mariadb_gtid {
            if ss.gtid_slave_pos.is_empty() || ss.using_gtid.is_none() {
                return Ok(());
            }
            let io_pos = GtidList::parse(&ss.gtid_io_pos);
            let slave_pos = GtidList::parse(&ss.gtid_slave_pos);
            info!(
                cluster = %cluster.name,
                "Waiting sync IO_Pos:{}, Slave_Pos:{}",
                io_pos,
                slave_pos
            );
            if slave_pos.equal(&io_pos) {
                return Ok(());
            }
        } else {
            info!(
                cluster = %cluster.name,
                "Waiting sync IO_Pos:{}/{}, Slave_Pos:{}/{}",
                ss.master_log_file,
                ss.read_master_log_pos,
                ss.relay_master_log_file,
                ss.exec_master_log_pos
            );
            if ss.master_log_file == ss.relay_master_log_file
                && ss.read_master_log_pos == ss.exec_master_log_pos
            {
                return Ok(());
            }
            if ss
                .slave_sql_running_state
                .contains("Slave has read all relay log")
            {
                return Ok(());
            }
        }

        if cluster.servers[idx].read().await.is_failed() {
            return Ok(());
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    Err(RepmanError::WaitTimeout(format!(
        "for relay log drain on {}",
        url
    )))
}

/// Promote the candidate: drop its replication configuration, enable
/// writes, record it as master.
async fn promote(cluster: &Cluster, idx: usize) -> Result<()> {
    let (conn, url, channel) = {
        let server = cluster.servers[idx].read().await;
        (
            server.conn()?,
            server.url.clone(),
            server.replication_source_name.clone(),
        )
    };

    conn.reset_slave(&channel, true).await?;
    conn.set_read_only(false).await?;

    let mut server = cluster.servers[idx].write().await;
    server.state = ServerState::Master;
    server.prev_state = ServerState::Master;
    server.is_slave = false;
    server.replications.clear();
    drop(server);

    cluster
        .events
        .publish(Event::new(
            EventType::MasterPromoted,
            &cluster.name,
            Some(url.clone()),
            format!("Server {} promoted to master", url),
        ))
        .await;
    Ok(())
}

/// Point one slave at the new master with the flavor-appropriate mode.
async fn reparent(cluster: &Cluster, slave_idx: usize, master_idx: usize) -> Result<()> {
    let reachable = {
        let server = cluster.servers[slave_idx].read().await;
        !server.is_failed() && server.conn.is_some()
    };
    if !reachable {
        return Err(RepmanError::ServerFailed(
            cluster.servers[slave_idx].read().await.url.clone(),
        ));
    }
    let conn = cluster.servers[slave_idx].read().await.conn()?;
    let channel = cluster.conf.replication.master_conn.clone();
    conn.stop_slave(&channel).await.ok();
    change_master_to(cluster, slave_idx, master_idx, ChangeMasterMode::SlavePos).await
}

/// Wait (bounded) for the InnoDB purge thread to drain the history list on
/// one server. Used before re-attaching a returning master, so row versions
/// from its former life are gone.
pub async fn wait_innodb_purge(cluster: &Cluster, idx: usize) -> Result<()> {
    let (conn, url) = {
        let server = cluster.servers[idx].read().await;
        (server.conn()?, server.url.clone())
    };

    for _ in 0..DRAIN_MAX_POLLS {
        let status = conn.get_innodb_status().await.unwrap_or_default();
        match parse_history_list_length(&status) {
            Some(len) if len > 0 => {
                info!(cluster = %cluster.name, server = %url, len, "Waiting for InnoDB history list to drain");
                tokio::time::sleep(DRAIN_POLL).await;
            }
            _ => return Ok(()),
        }
    }
    Err(RepmanError::WaitTimeout(format!(
        "for InnoDB history list to drain on {}",
        url
    )))
}

fn parse_history_list_length(innodb_status: &str) -> Option<u64> {
    innodb_status
        .lines()
        .find_map(|line| line.trim().strip_prefix("History list length "))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Re-attach a returning master as a slave of the current master. Invoked
/// by the monitor when a previously failed server comes back with no
/// replication configured.
pub async fn rejoin_master(cluster: &Cluster, idx: usize) -> Result<()> {
    if cluster.sme.is_in_failover() {
        return Ok(());
    }
    let Some(master_idx) = cluster.master_index().await else {
        return Ok(());
    };
    if master_idx == idx {
        return Ok(());
    }

    let url = cluster.servers[idx].read().await.url.clone();
    info!(cluster = %cluster.name, "Rejoining old master {} under current master", url);
    wait_innodb_purge(cluster, idx).await?;
    change_master_to(cluster, idx, master_idx, ChangeMasterMode::CurrentPos).await?;

    {
        let server = cluster.servers[idx].read().await;
        if !cluster.conf.is_ignored_readonly(&server.url) {
            if let Some(conn) = server.conn.clone() {
                let _ = conn.set_read_only(true).await;
            }
        }
    }

    cluster
        .events
        .publish(Event::new(
            EventType::ServerRejoined,
            &cluster.name,
            Some(url.clone()),
            format!("Server {} rejoined as slave", url),
        ))
        .await;
    Ok(())
}

/// Re-attach a returning slave: re-point it when its source is stale, or
/// just restart its threads.
pub async fn rejoin_slave(cluster: &Cluster, idx: usize) -> Result<()> {
    if cluster.sme.is_in_failover() {
        return Ok(());
    }
    let Some(master_idx) = cluster.master_index().await else {
        return Ok(());
    };

    let (url, channel, conn, current_source) = {
        let server = cluster.servers[idx].read().await;
        (
            server.url.clone(),
            server.replication_source_name.clone(),
            server.conn.clone(),
            server
                .slave_status()
                .map(|ss| (ss.master_host.clone(), ss.master_port)),
        )
    };
    let (master_host, master_port) = {
        let master = cluster.servers[master_idx].read().await;
        (master.host.clone(), master.port)
    };

    let points_at_master = current_source
        .map(|(h, p)| h == master_host && p == master_port)
        .unwrap_or(false);

    if points_at_master {
        if let Some(conn) = conn {
            conn.start_slave(&channel).await.ok();
        }
    } else {
        info!(cluster = %cluster.name, "Repointing returning slave {} at current master", url);
        change_master_to(cluster, idx, master_idx, ChangeMasterMode::SlavePos).await?;
    }

    cluster
        .events
        .publish(Event::new(
            EventType::ServerRejoined,
            &cluster.name,
            Some(url.clone()),
            format!("Slave {} rejoined", url),
        ))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::cluster::bootstrap;
    use crate::config::Config;
    use crate::db::simulator::SimFleet;
    use tempfile::TempDir;

    async fn bootstrapped_cluster(tmp: &TempDir) -> (SimFleet, Arc<Cluster>) {
        let fleet = SimFleet::new();
        for port in [3306u16, 3307, 3308] {
            fleet.add_server("127.0.0.1", port, "10.5.9-MariaDB-log");
        }

        let mut conf = Config::development();
        conf.cluster.working_dir = tmp.path().to_path_buf();
        conf.failover.switch_wait_kill = std::time::Duration::from_millis(2000);
        let cluster = Cluster::new(Arc::new(conf), fleet.connector()).unwrap();
        for (i, port) in [3306u16, 3307, 3308].iter().enumerate() {
            let conn = fleet.handle("127.0.0.1", *port).unwrap().client();
            cluster.servers[i].write().await.conn = Some(conn);
        }

        bootstrap::bootstrap_replication(&cluster, true)
            .await
            .unwrap();
        (fleet, cluster)
    }

    #[tokio::test]
    async fn test_switchover_promotes_candidate() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = bootstrapped_cluster(&tmp).await;
        assert_eq!(cluster.master_index().await, Some(0));

        switchover(&cluster).await.unwrap();

        assert!(!cluster.sme.is_in_failover());
        let new_master = cluster.master_index().await.unwrap();
        assert_ne!(new_master, 0);
        assert_eq!(
            cluster.servers[new_master].read().await.state,
            ServerState::Master
        );
        // The old master was demoted, reparented and set read-only.
        let old = fleet.handle("127.0.0.1", 3306).unwrap();
        assert!(old.is_read_only());
        let new_port = 3306 + new_master as u16;
        assert_eq!(
            old.channel_source(""),
            Some(("127.0.0.1".to_string(), new_port))
        );
    }

    #[tokio::test]
    async fn test_switchover_freeze_drain_bound() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = bootstrapped_cluster(&tmp).await;
        let old_master = fleet.handle("127.0.0.1", 3306).unwrap();
        // One stubborn write thread that never finishes on its own.
        old_master.set_long_write_threads(1);

        switchover(&cluster).await.unwrap();

        // 2000 ms budget at 500 ms granularity: at most 5 polls, then the
        // remaining threads are killed.
        assert!(old_master.long_write_poll_count() <= 5);
        assert_eq!(old_master.killed_thread_batches(), 1);
    }

    #[tokio::test]
    async fn test_failover_skips_freeze_and_old_master() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = bootstrapped_cluster(&tmp).await;
        let old_master = fleet.handle("127.0.0.1", 3306).unwrap();
        old_master.set_unreachable(true);
        cluster.servers[0].write().await.state = ServerState::Failed;

        master_failover(&cluster).await.unwrap();

        assert!(!cluster.sme.is_in_failover());
        let new_master = cluster.master_index().await.unwrap();
        assert_ne!(new_master, 0);
        // The unreachable master was not frozen or reparented.
        assert_eq!(old_master.killed_thread_batches(), 0);
        assert!(!cluster.slave_indices().await.contains(&0));
    }

    #[tokio::test]
    async fn test_candidate_election_prefers_flagged_host() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = bootstrapped_cluster(&tmp).await;
        cluster.servers[2].write().await.prefered = true;

        let candidate = elect_candidate(&cluster, Some(0)).await.unwrap();
        assert_eq!(candidate, 2);
    }

    #[tokio::test]
    async fn test_candidate_election_excludes_ignored_and_delayed() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = bootstrapped_cluster(&tmp).await;
        cluster.servers[1].write().await.ignored = true;
        cluster.servers[2].write().await.is_delayed = true;

        assert!(matches!(
            elect_candidate(&cluster, Some(0)).await,
            Err(RepmanError::NoCandidate)
        ));
    }

    #[tokio::test]
    async fn test_candidate_election_ranks_by_gtid() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = bootstrapped_cluster(&tmp).await;
        cluster.servers[1].write().await.slave_gtid = GtidList::parse("0-1-50");
        cluster.servers[2].write().await.slave_gtid = GtidList::parse("0-1-80");

        let candidate = elect_candidate(&cluster, Some(0)).await.unwrap();
        assert_eq!(candidate, 2);
    }

    #[tokio::test]
    async fn test_second_exclusive_operation_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = bootstrapped_cluster(&tmp).await;

        cluster.sme.set_failover_state().unwrap();
        assert!(matches!(
            switchover(&cluster).await,
            Err(RepmanError::FailoverInProgress)
        ));
        assert!(matches!(
            master_failover(&cluster).await,
            Err(RepmanError::FailoverInProgress)
        ));
        cluster.sme.remove_failover_state();
    }

    #[tokio::test]
    async fn test_gate_released_when_no_candidate() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = bootstrapped_cluster(&tmp).await;
        for idx in [1usize, 2] {
            cluster.servers[idx].write().await.ignored = true;
        }

        assert!(matches!(
            switchover(&cluster).await,
            Err(RepmanError::NoCandidate)
        ));
        assert!(!cluster.sme.is_in_failover());
    }

    #[test]
    fn test_parse_history_list_length() {
        let status = "=====\nTRANSACTIONS\n------------\nTrx id counter 42\nHistory list length 17\n";
        assert_eq!(parse_history_list_length(status), Some(17));
        assert_eq!(parse_history_list_length("no such line"), None);
    }

    #[tokio::test]
    async fn test_rejoin_master_reattaches_under_new_master() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = bootstrapped_cluster(&tmp).await;

        // Fail over away from server 0.
        cluster.servers[0].write().await.state = ServerState::Failed;
        fleet
            .handle("127.0.0.1", 3306)
            .unwrap()
            .set_unreachable(true);
        master_failover(&cluster).await.unwrap();
        let new_master = cluster.master_index().await.unwrap();

        // Server 0 comes back empty.
        let handle = fleet.handle("127.0.0.1", 3306).unwrap();
        handle.set_unreachable(false);
        {
            let client = handle.client();
            client.reset_slave("", true).await.unwrap();
            cluster.servers[0].write().await.conn = Some(client);
            cluster.servers[0].write().await.state = ServerState::StandAlone;
        }

        rejoin_master(&cluster, 0).await.unwrap();
        let new_port = 3306 + new_master as u16;
        assert_eq!(
            handle.channel_source(""),
            Some(("127.0.0.1".to_string(), new_port))
        );
        assert_eq!(handle.channel_mode(""), Some(crate::db::MasterUseGtid::CurrentPos));
        assert!(handle.is_read_only());
    }
}

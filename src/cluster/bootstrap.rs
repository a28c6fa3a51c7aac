//! Replication bootstrap and teardown: wire a set of fresh servers into
//! the declared topology, or cleanly undo such a wiring.

use crate::cluster::Cluster;
use crate::db::{ChangeMasterOpt, MasterUseGtid};
use crate::error::{RepmanError, Result};
use crate::events::{Event, EventType};
use crate::gtid::GtidList;
use crate::server::refresh;
use crate::state::FailoverGate;
use crate::topology::{self, TopologyKind};
use tracing::{info, warn};

/// Positioning mode requested by a wiring step. The flavor-appropriate
/// statement is chosen inside [`change_master_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMasterMode {
    SlavePos,
    CurrentPos,
}

/// Full bootstrap: provision services, wait for connectivity, then wire
/// replication.
pub async fn bootstrap(cluster: &Cluster) -> Result<()> {
    super::provision::provision_all(cluster).await?;
    super::provision::wait_database_can_conn(cluster).await?;
    bootstrap_replication(cluster, true).await?;
    cluster
        .events
        .publish(Event::new(
            EventType::BootstrapCompleted,
            &cluster.name,
            None,
            "Bootstrap completed",
        ))
        .await;
    Ok(())
}

/// Undo replication on every reachable server. Per-server errors are
/// logged; cleanup continues with the remainder.
pub async fn bootstrap_replication_cleanup(cluster: &Cluster) -> Result<()> {
    info!(cluster = %cluster.name, "Cleaning up replication on existing servers");
    let _gate = FailoverGate::acquire(&cluster.sme)?;

    let channel = cluster.conf.replication.master_conn.clone();
    for idx in 0..cluster.servers.len() {
        let url = cluster.servers[idx].read().await.url.clone();
        if cluster.servers[idx].read().await.is_failed() {
            continue;
        }
        if let Err(e) = refresh::refresh(cluster, idx).await {
            warn!(server = %url, error = %e, "Refresh failed in cleanup");
            continue;
        }
        let (conn, is_mariadb) = {
            let server = cluster.servers[idx].read().await;
            match server.conn.clone() {
                Some(conn) => (conn, server.version.is_mariadb()),
                None => continue,
            }
        };

        if let Err(e) = conn.set_default_master_conn(&channel).await {
            warn!(server = %url, error = %e, "Could not set default master connection");
            continue;
        }
        info!(cluster = %cluster.name, "Reset Master on server {}", url);
        if let Err(e) = conn.reset_master().await {
            warn!(server = %url, error = %e, "Reset master failed");
        }
        let stop_result = if is_mariadb {
            conn.stop_all_slaves().await
        } else {
            conn.stop_slave(&channel).await
        };
        if let Err(e) = stop_result {
            warn!(server = %url, error = %e, "Stop slave failed");
        }
        if let Err(e) = conn.reset_slave(&channel, true).await {
            warn!(server = %url, error = %e, "Reset slave failed");
        }
        if is_mariadb {
            if let Err(e) = conn.set_gtid_slave_pos(&GtidList::default()).await {
                warn!(server = %url, error = %e, "Could not reset gtid_slave_pos");
            }
        }

        // The wiring is gone; demote the record so rediscovery starts from
        // a blank slate instead of a remembered role.
        let mut server = cluster.servers[idx].write().await;
        server.replications.clear();
        server.is_slave = false;
        server.is_relay = false;
        server.state = crate::server::ServerState::StandAlone;
        server.prev_state = crate::server::ServerState::StandAlone;
    }

    cluster.clear_pointers().await;
    cluster.sme.undiscovered();
    Ok(())
}

/// Wire the declared topology. With `clean` set, tear down whatever wiring
/// exists first; bootstrap then requires an empty environment.
pub async fn bootstrap_replication(cluster: &Cluster, clean: bool) -> Result<()> {
    if cluster.conf.topology_kind() == TopologyKind::MultiMasterWsrep {
        info!(cluster = %cluster.name, "Galera cluster ignoring replication setup");
        return Ok(());
    }

    if clean {
        if let Err(e) = bootstrap_replication_cleanup(cluster).await {
            warn!(cluster = %cluster.name, error = %e, "Cleanup error");
        }
    }

    for idx in 0..cluster.servers.len() {
        if cluster.servers[idx].read().await.is_failed() {
            continue;
        }
        let _ = refresh::refresh(cluster, idx).await;
    }

    if topology::discover(cluster).await.is_ok() {
        return Err(RepmanError::AlreadyBootstrapped);
    }

    let gate = FailoverGate::acquire(&cluster.sme)?;

    let master_key = match &cluster.conf.topology.pref_master {
        Some(_) => {
            let mut found = None;
            for (idx, server) in cluster.servers.iter().enumerate() {
                if server.read().await.prefered {
                    found = Some(idx);
                    break;
                }
            }
            found.ok_or(RepmanError::PreferredMasterNotFound)?
        }
        None => 0,
    };

    match cluster.conf.topology_kind() {
        TopologyKind::MultiTierSlave => wire_multi_tier(cluster).await?,
        TopologyKind::MultiMaster2Node => wire_two_node(cluster).await?,
        TopologyKind::MultiMasterRing => wire_ring(cluster).await?,
        // The binlog relay wires itself; the manager only discovers it.
        TopologyKind::MaxscaleBinlog => {}
        _ => wire_master_slave(cluster, master_key).await?,
    }

    gate.release();

    // Refresh so discovery sees the new replication graph, then require it
    // to succeed.
    for idx in 0..cluster.servers.len() {
        if cluster.servers[idx].read().await.is_failed() {
            continue;
        }
        let _ = refresh::refresh(cluster, idx).await;
    }
    topology::discover(cluster).await?;

    info!(
        cluster = %cluster.name,
        master = ?cluster.master_index().await,
        "Environment bootstrapped"
    );
    Ok(())
}

/// Simple master/slave wiring: the master gets read/write, every other
/// server replicates from it with SLAVE_POS.
async fn wire_master_slave(cluster: &Cluster, master_key: usize) -> Result<()> {
    for idx in 0..cluster.servers.len() {
        let (failed, url, conn) = {
            let server = cluster.servers[idx].read().await;
            (server.is_failed(), server.url.clone(), server.conn.clone())
        };
        if failed {
            continue;
        }
        let conn = conn.ok_or_else(|| RepmanError::NotConnected(url.clone()))?;

        if idx == master_key {
            conn.flush_tables().await.ok();
            conn.set_read_only(false).await?;
        } else {
            change_master_to(cluster, idx, master_key, ChangeMasterMode::SlavePos).await?;
            if !cluster.conf.is_ignored_readonly(&url) {
                conn.set_read_only(true).await?;
            }
        }
    }
    Ok(())
}

/// Multi-tier wiring: server 0 is master, server 1 relays from it, leaves
/// replicate from the relay; all with CURRENT_POS.
async fn wire_multi_tier(cluster: &Cluster) -> Result<()> {
    let master_key = 0;
    let relay_key = 1;
    for idx in 0..cluster.servers.len() {
        let (failed, url, conn) = {
            let server = cluster.servers[idx].read().await;
            (server.is_failed(), server.url.clone(), server.conn.clone())
        };
        if failed {
            continue;
        }
        let conn = conn.ok_or_else(|| RepmanError::NotConnected(url.clone()))?;

        if idx == master_key {
            conn.flush_tables().await.ok();
            conn.set_read_only(false).await?;
            continue;
        }

        conn.stop_all_slaves().await.ok();
        conn.reset_slave(&cluster.conf.replication.master_conn, true)
            .await
            .ok();

        let source = if idx == relay_key { master_key } else { relay_key };
        change_master_to(cluster, idx, source, ChangeMasterMode::CurrentPos).await?;
        if !cluster.conf.is_ignored_readonly(&url) {
            conn.set_read_only(true).await?;
        }
    }
    Ok(())
}

/// Two-node active-active wiring: nodes 0 and 1 point at each other; any
/// further declared server replicates from node 1. Every non-ignored node
/// ends read-only, node 0 included.
async fn wire_two_node(cluster: &Cluster) -> Result<()> {
    for idx in 0..cluster.servers.len() {
        let (failed, url, conn) = {
            let server = cluster.servers[idx].read().await;
            (server.is_failed(), server.url.clone(), server.conn.clone())
        };
        if failed {
            continue;
        }
        let conn = conn.ok_or_else(|| RepmanError::NotConnected(url.clone()))?;

        let source = match idx {
            0 => 1,
            1 => 0,
            // Extra declared servers hang off server 0's partner.
            _ => 1,
        };
        change_master_to(cluster, idx, source, ChangeMasterMode::CurrentPos).await?;

        if !cluster.conf.is_ignored_readonly(&url) {
            conn.set_read_only(true).await?;
        }
    }
    Ok(())
}

/// Ring wiring: every server replicates from its predecessor (cyclic);
/// server 0 becomes the virtual master.
async fn wire_ring(cluster: &Cluster) -> Result<()> {
    let count = cluster.servers.len();
    for idx in 0..count {
        if cluster.servers[idx].read().await.is_failed() {
            continue;
        }
        let source = (count + idx - 1) % count;
        change_master_to(cluster, idx, source, ChangeMasterMode::SlavePos).await?;
    }
    Ok(())
}

/// Issue the flavor-appropriate CHANGE MASTER on `slave_idx` pointing at
/// `master_idx`, then start the configured channel.
///
/// Style selection: MariaDB ≥ 10 without forced-no-GTID seeds
/// `gtid_slave_pos` from the master's current GTID and uses the requested
/// GTID mode; MySQL with GTID uses auto-positioning; anything else falls
/// back to the master's binlog file and offset.
pub async fn change_master_to(
    cluster: &Cluster,
    slave_idx: usize,
    master_idx: usize,
    mode: ChangeMasterMode,
) -> Result<()> {
    // The master's position must be current before it is copied.
    let _ = refresh::refresh(cluster, master_idx).await;
    let (master_host, master_port, master_gtid, master_file, master_pos, master_url) = {
        let master = cluster.servers[master_idx].read().await;
        (
            master.host.clone(),
            master.port,
            master.current_gtid.clone(),
            master.master_status.file.clone(),
            master.master_status.position,
            master.url.clone(),
        )
    };

    let (conn, url, version, have_mysql_gtid, is_delayed) = {
        let server = cluster.servers[slave_idx].read().await;
        (
            server.conn(),
            server.url.clone(),
            server.version.clone(),
            server.have_mysql_gtid,
            server.is_delayed,
        )
    };
    let conn = conn?;

    let repl = &cluster.conf.replication;
    let mut opt = ChangeMasterOpt {
        host: master_host,
        port: master_port,
        user: repl.credentials.user.clone(),
        password: repl.credentials.password.clone(),
        channel: repl.master_conn.clone(),
        mode: MasterUseGtid::SlavePos,
        retry: repl.heartbeat_retry,
        heartbeat_secs: repl.heartbeat_time,
        ssl: repl.ssl,
        delayed: is_delayed,
        delay_secs: repl.hosts_delayed_time,
    };

    if !repl.force_slave_no_gtid && version.is_mariadb() && version.major >= 10 {
        conn.set_gtid_slave_pos(&master_gtid).await?;
        opt.mode = match mode {
            ChangeMasterMode::SlavePos => MasterUseGtid::SlavePos,
            ChangeMasterMode::CurrentPos => MasterUseGtid::CurrentPos,
        };
        info!(cluster = %cluster.name, "Replication bootstrapped with {} as master", master_url);
    } else if have_mysql_gtid && !repl.force_slave_no_gtid {
        opt.mode = MasterUseGtid::AutoPosition;
        info!(
            cluster = %cluster.name,
            "Replication bootstrapped with MySQL GTID replication style and {} as master",
            master_url
        );
    } else {
        opt.mode = MasterUseGtid::Positional {
            file: master_file,
            pos: master_pos,
        };
        info!(
            cluster = %cluster.name,
            "Replication bootstrapped with old replication style and {} as master",
            master_url
        );
    }

    if let Err(e) = conn.change_master(opt).await {
        warn!(server = %url, master = %master_url, error = %e, "Replication can't be bootstrapped");
        return Err(e.into());
    }
    conn.start_slave(&repl.master_conn)
        .await
        .map_err(|e| RepmanError::Internal(format!("Can't start slave: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::Config;
    use crate::db::simulator::SimFleet;
    use tempfile::TempDir;

    async fn sim_cluster(
        tmp: &TempDir,
        versions: &[&str],
        mutate: impl FnOnce(&mut Config),
    ) -> (SimFleet, Arc<Cluster>) {
        let fleet = SimFleet::new();
        let mut servers = Vec::new();
        for (i, version) in versions.iter().enumerate() {
            let port = 3306 + i as u16;
            fleet.add_server("127.0.0.1", port, version);
            servers.push(format!("127.0.0.1:{}", port));
        }

        let mut conf = Config::development();
        conf.cluster.servers = servers;
        conf.cluster.working_dir = tmp.path().to_path_buf();
        mutate(&mut conf);
        let cluster = Cluster::new(Arc::new(conf), fleet.connector()).unwrap();

        for (i, _) in versions.iter().enumerate() {
            let port = 3306 + i as u16;
            let conn = fleet.handle("127.0.0.1", port).unwrap().client();
            cluster.servers[i].write().await.conn = Some(conn);
        }
        (fleet, cluster)
    }

    #[tokio::test]
    async fn test_change_master_chooses_mariadb_gtid_path() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(
            &tmp,
            &["10.5.9-MariaDB-log", "10.5.9-MariaDB-log"],
            |_| {},
        )
        .await;
        refresh::refresh(&cluster, 1).await.unwrap();

        change_master_to(&cluster, 1, 0, ChangeMasterMode::SlavePos)
            .await
            .unwrap();
        let handle = fleet.handle("127.0.0.1", 3307).unwrap();
        assert_eq!(handle.channel_mode(""), Some(MasterUseGtid::SlavePos));
    }

    #[tokio::test]
    async fn test_change_master_chooses_mysql_auto_position() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, &["8.0.30", "8.0.30"], |_| {}).await;
        fleet
            .handle("127.0.0.1", 3307)
            .unwrap()
            .set_variable("GTID_MODE", "ON");
        refresh::refresh(&cluster, 1).await.unwrap();

        change_master_to(&cluster, 1, 0, ChangeMasterMode::SlavePos)
            .await
            .unwrap();
        let handle = fleet.handle("127.0.0.1", 3307).unwrap();
        assert_eq!(handle.channel_mode(""), Some(MasterUseGtid::AutoPosition));
    }

    #[tokio::test]
    async fn test_change_master_positional_when_forced_no_gtid() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(
            &tmp,
            &["10.5.9-MariaDB-log", "10.5.9-MariaDB-log"],
            |conf| conf.replication.force_slave_no_gtid = true,
        )
        .await;
        refresh::refresh(&cluster, 1).await.unwrap();

        change_master_to(&cluster, 1, 0, ChangeMasterMode::SlavePos)
            .await
            .unwrap();
        let handle = fleet.handle("127.0.0.1", 3307).unwrap();
        assert!(matches!(
            handle.channel_mode(""),
            Some(MasterUseGtid::Positional { .. })
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_master_slave_three_nodes() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (fleet, cluster) = sim_cluster(&tmp, &versions, |_| {}).await;

        bootstrap_replication(&cluster, true).await.unwrap();

        assert_eq!(cluster.master_index().await, Some(0));
        assert!(!cluster.sme.is_in_failover());
        for port in [3307u16, 3308] {
            let handle = fleet.handle("127.0.0.1", port).unwrap();
            assert_eq!(handle.channel_source(""), Some(("127.0.0.1".to_string(), 3306)));
            assert_eq!(handle.channel_mode(""), Some(MasterUseGtid::SlavePos));
            assert!(handle.is_read_only());
        }
        assert!(!fleet.handle("127.0.0.1", 3306).unwrap().is_read_only());
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_existing_topology() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (_fleet, cluster) = sim_cluster(&tmp, &versions, |_| {}).await;

        bootstrap_replication(&cluster, true).await.unwrap();
        // Without cleanup the environment is already wired.
        let err = bootstrap_replication(&cluster, false).await.unwrap_err();
        assert!(matches!(err, RepmanError::AlreadyBootstrapped));
    }

    #[tokio::test]
    async fn test_bootstrap_idempotent_with_cleanup() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (_fleet, cluster) = sim_cluster(&tmp, &versions, |_| {}).await;

        bootstrap_replication(&cluster, true).await.unwrap();
        let first = cluster.pointers().await;
        bootstrap_replication(&cluster, true).await.unwrap();
        let second = cluster.pointers().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_bootstrap_multi_tier() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 4];
        let (fleet, cluster) =
            sim_cluster(&tmp, &versions, |conf| conf.topology.multi_tier_slave = true).await;

        bootstrap_replication(&cluster, true).await.unwrap();

        assert_eq!(cluster.master_index().await, Some(0));
        let relay = fleet.handle("127.0.0.1", 3307).unwrap();
        assert_eq!(relay.channel_source(""), Some(("127.0.0.1".to_string(), 3306)));
        assert_eq!(relay.channel_mode(""), Some(MasterUseGtid::CurrentPos));
        for port in [3308u16, 3309] {
            let leaf = fleet.handle("127.0.0.1", port).unwrap();
            assert_eq!(leaf.channel_source(""), Some(("127.0.0.1".to_string(), 3307)));
            assert_eq!(leaf.channel_mode(""), Some(MasterUseGtid::CurrentPos));
            assert!(leaf.is_read_only());
        }
        // The relay classifies as such after discovery.
        assert!(cluster.servers[1].read().await.is_relay);
    }

    #[tokio::test]
    async fn test_bootstrap_ring() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (fleet, cluster) =
            sim_cluster(&tmp, &versions, |conf| conf.topology.multi_master_ring = true).await;

        bootstrap_replication(&cluster, true).await.unwrap();

        // Server i replicates from (i - 1) mod 3.
        for (idx, expected_source) in [(0usize, 3308u16), (1, 3306), (2, 3307)] {
            let handle = fleet.handle("127.0.0.1", 3306 + idx as u16).unwrap();
            assert_eq!(
                handle.channel_source(""),
                Some(("127.0.0.1".to_string(), expected_source))
            );
        }
        assert_eq!(cluster.vmaster_index().await, Some(0));
    }

    #[tokio::test]
    async fn test_bootstrap_two_node_leaves_both_read_only() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 2];
        let (fleet, cluster) =
            sim_cluster(&tmp, &versions, |conf| conf.topology.multi_master = true).await;

        bootstrap_replication(&cluster, true).await.unwrap();

        let a = fleet.handle("127.0.0.1", 3306).unwrap();
        let b = fleet.handle("127.0.0.1", 3307).unwrap();
        assert_eq!(a.channel_source(""), Some(("127.0.0.1".to_string(), 3307)));
        assert_eq!(b.channel_source(""), Some(("127.0.0.1".to_string(), 3306)));
        assert!(a.is_read_only());
        assert!(b.is_read_only());
        assert!(cluster.master_index().await.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_wsrep_skips_wiring() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 2];
        let (fleet, cluster) = sim_cluster(&tmp, &versions, |conf| {
            conf.topology.multi_master_wsrep = true
        })
        .await;

        bootstrap_replication(&cluster, true).await.unwrap();
        assert!(!fleet.handle("127.0.0.1", 3306).unwrap().has_channel(""));
        assert!(!fleet.handle("127.0.0.1", 3307).unwrap().has_channel(""));
    }

    #[tokio::test]
    async fn test_preferred_master_selected() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (fleet, cluster) = sim_cluster(&tmp, &versions, |conf| {
            conf.topology.pref_master = Some("127.0.0.1:3307".to_string())
        })
        .await;

        bootstrap_replication(&cluster, true).await.unwrap();
        assert_eq!(cluster.master_index().await, Some(1));
        let slave = fleet.handle("127.0.0.1", 3306).unwrap();
        assert_eq!(slave.channel_source(""), Some(("127.0.0.1".to_string(), 3307)));
    }

    #[tokio::test]
    async fn test_failed_server_skipped_in_wiring() {
        let tmp = TempDir::new().unwrap();
        let versions = ["10.5.9-MariaDB-log"; 3];
        let (fleet, cluster) = sim_cluster(&tmp, &versions, |_| {}).await;

        cluster.servers[2].write().await.state = crate::server::ServerState::Failed;
        bootstrap_replication(&cluster, true).await.unwrap();

        assert!(!fleet.handle("127.0.0.1", 3308).unwrap().has_channel(""));
        assert_eq!(cluster.master_index().await, Some(0));
    }
}

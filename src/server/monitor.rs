//! Per-server probe tick: connectivity check, failure accounting, state
//! classification and rejoin dispatch.
//!
//! One probe runs per server per monitoring tick. Probes for one server are
//! serialized by the server lock; probes across servers run concurrently.

use crate::cluster::{failover, Cluster};
use crate::config::CheckType;
use crate::db::DbError;
use crate::error::Result;
use crate::server::{refresh, ServerState};
use crate::state::ErrorLevel;
use crate::topology::TopologyKind;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of the connectivity check.
enum ProbeFailure {
    Db(DbError),
    Agent(String),
}

/// Probe one server: check connectivity, walk the failure or success path,
/// and fire edge-triggered notifications.
pub async fn probe(cluster: &Cluster, idx: usize) {
    let (host, port, url) = {
        let server = cluster.servers[idx].read().await;
        (server.host.clone(), server.port, server.url.clone())
    };

    let check = match cluster.conf.monitoring.check_type {
        CheckType::Tcp => cluster
            .connector
            .connect(&host, port, &cluster.conf.replication.monitor_credentials)
            .await
            .map(Some)
            .map_err(ProbeFailure::Db),
        CheckType::Agent => agent_check(cluster, &host).await.map(|_| None),
    };

    match check {
        Err(failure) => handle_probe_failure(cluster, idx, &url, failure).await,
        Ok(probe_conn) => {
            // Agent mode verified liveness over HTTP; a database handle is
            // still needed for refresh.
            let probe_conn = match probe_conn {
                Some(conn) => conn,
                None => match cluster
                    .connector
                    .connect(&host, port, &cluster.conf.replication.monitor_credentials)
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        handle_probe_failure(cluster, idx, &url, ProbeFailure::Db(e)).await;
                        return;
                    }
                },
            };
            handle_probe_success(cluster, idx, &url, probe_conn).await;
        }
    }
}

async fn agent_check(cluster: &Cluster, host: &str) -> std::result::Result<(), ProbeFailure> {
    let url = format!(
        "http://{}:{}/check/",
        host, cluster.conf.monitoring.agent_port
    );
    match cluster.http.get(&url).send().await {
        Ok(resp) if resp.status().as_u16() == 200 => Ok(()),
        Ok(resp) => Err(ProbeFailure::Agent(format!(
            "HTTP Response Code Error: {}",
            resp.status().as_u16()
        ))),
        Err(e) => Err(ProbeFailure::Agent(e.to_string())),
    }
}

/// The failure path: sticky-state copy, auth short-circuit, fail counting
/// with the Suspect/Failed threshold, slave ejection.
async fn handle_probe_failure(
    cluster: &Cluster,
    idx: usize,
    url: &str,
    failure: ProbeFailure,
) {
    let master_idx = cluster.master_index().await;
    let max_fail = cluster.conf.monitoring.max_fail;

    let edge = {
        let mut server = cluster.servers[idx].write().await;

        // Copy the last known sticky states or they will be cleared at the
        // next monitoring loop.
        if server.state != ServerState::Failed {
            cluster.sme.copy_old_state_from_unknown_server(url);
        }

        if let ProbeFailure::Db(db_err) = &failure {
            if db_err.is_auth() {
                server.state = ServerState::ErrorAuth;
                cluster.sme.set_state(
                    "ERR00004",
                    ErrorLevel::Err,
                    "SRV",
                    format!("Database {} access denied: {}", url, db_err),
                    Some(url.to_string()),
                );
                return;
            }
        }

        // The counter honors the threshold: past MaxFail it only keeps
        // growing while a failover holds the monitors away from refresh.
        if server.fail_count < max_fail || cluster.sme.is_in_failover() {
            server.fail_count += 1;
        }
        if server.fail_count == 1 {
            server.fail_suspect_heartbeat = cluster.sme.heartbeats();
        }

        if master_idx == Some(idx) {
            if server.state != ServerState::Failed {
                info!(
                    cluster = %cluster.name,
                    "Master failure detected! Retry {}/{}",
                    server.fail_count,
                    max_fail
                );
            }
            if server.fail_count >= max_fail {
                // Declared failed exactly once, on the threshold edge.
                if server.state != ServerState::Failed {
                    info!(cluster = %cluster.name, "Declaring db master as failed {}", url);
                    server.state = ServerState::Failed;
                    server.del_wait_stop_cookie();
                }
            } else {
                server.state = ServerState::Suspect;
            }
        } else {
            debug!(
                server = %url,
                fail_count = server.fail_count,
                max_fail,
                "Failure detection on non-master"
            );
            if server.fail_count >= max_fail {
                if server.state != ServerState::Failed {
                    info!(cluster = %cluster.name, "Declaring slave db {} as failed", url);
                    server.state = ServerState::Failed;
                    server.del_wait_stop_cookie();
                    if !server.replications.is_empty() {
                        server.last_seen_replications = std::mem::take(&mut server.replications);
                    }
                }
            } else {
                server.state = ServerState::Suspect;
            }
        }

        let edge = server.prev_state != server.state;
        let prev = server.prev_state;
        let new = server.state;
        if edge {
            server.prev_state = server.state;
        }
        (edge, prev, new)
    };

    let (changed, prev, new) = edge;
    if changed {
        debug!(server = %url, "Server state changed from {} to {}", prev, new);
        if new == ServerState::Failed {
            cluster.remove_from_slaves(idx).await;
        }
        if new != ServerState::Suspect {
            cluster.backend_state_change_proxies().await;
            cluster.send_alert(url, prev, new).await;
            let _ = process_failed_slave(cluster, idx).await;
        }
    }
}

/// The success path: adopt or refresh the persistent handle, reset fail
/// accounting, classify rejoin.
async fn handle_probe_success(
    cluster: &Cluster,
    idx: usize,
    url: &str,
    probe_conn: Arc<dyn crate::db::DatabaseClient>,
) {
    if cluster.sme.is_in_failover() {
        debug!(server = %url, "Inside failover, skipping refresh");
        return;
    }

    {
        let mut server = cluster.servers[idx].write().await;
        if server.conn.is_none() {
            server.conn = Some(probe_conn);
            info!(cluster = %cluster.name, "Assigning a global connection on server {}", url);
            return;
        }
    }

    if let Err(e) = refresh::refresh(cluster, idx).await {
        let mut server = cluster.servers[idx].write().await;
        server.conn = Some(probe_conn);
        info!(server = %url, error = %e, "Server refresh failed but ping connect");
        return;
    }

    let (prev_state, no_replication) = {
        let mut server = cluster.servers[idx].write().await;

        // The orchestrator tracks restarts through these cookies.
        if server.prev_state == ServerState::Failed {
            server.del_wait_start_cookie();
            server.del_restart_cookie();
        }

        if !server.state.is_unavailable() && server.fail_count > 0 {
            server.fail_count = 0;
            server.fail_suspect_heartbeat = 0;
        }

        (server.prev_state, server.replications.is_empty())
    };

    if no_replication {
        classify_standalone(cluster, idx, url, prev_state).await;
    } else if prev_state == ServerState::Failed && cluster.is_active() {
        if let Err(e) = failover::rejoin_slave(cluster, idx).await {
            warn!(server = %url, error = %e, "Slave rejoin failed");
        }
    }

    // Edge-triggered notifications.
    let edge = {
        let mut server = cluster.servers[idx].write().await;
        if server.prev_state != server.state {
            let prev = server.prev_state;
            server.prev_state = server.state;
            Some((prev, server.state))
        } else {
            None
        }
    };
    if let Some((prev, new)) = edge {
        if new != ServerState::Suspect {
            cluster.backend_state_change_proxies().await;
            cluster.send_alert(url, prev, new).await;
            let _ = process_failed_slave(cluster, idx).await;
        }
    }
}

/// A reachable server with no replication configured: reintroduce it as
/// StandAlone, enforce read-only, and hand a returning master to rejoin.
async fn classify_standalone(
    cluster: &Cluster,
    idx: usize,
    url: &str,
    prev_state: ServerState,
) {
    let topology = cluster.conf.topology_kind();

    if prev_state == ServerState::Failed || prev_state == ServerState::ErrorAuth {
        debug!(server = %url, "State comparison reinitialized failed server as unconnected");
        cluster.apply_read_only_if_required(idx).await;
        {
            let mut server = cluster.servers[idx].write().await;
            server.state = ServerState::StandAlone;
            server.fail_count = 0;
        }
        cluster.backend_state_change_proxies().await;
        cluster
            .send_alert(url, prev_state, ServerState::StandAlone)
            .await;

        if cluster.conf.failover.autorejoin && cluster.is_active() {
            if let Err(e) = failover::rejoin_master(cluster, idx).await {
                warn!(server = %url, error = %e, "Master rejoin failed");
            }
        } else {
            info!(cluster = %cluster.name, "Auto Rejoin is disabled");
        }
        return;
    }

    let state = cluster.servers[idx].read().await.state;
    if state != ServerState::Master && prev_state != ServerState::StandAlone {
        // A master candidate must pass through StandAlone before discovery
        // can elect it.
        if topology != TopologyKind::MultiMasterWsrep {
            let mut server = cluster.servers[idx].write().await;
            server.state = ServerState::StandAlone;
            debug!(server = %url, "State unconnected set by non-master rule");
        }
        cluster.apply_read_only_if_required(idx).await;

        if state != ServerState::Suspect {
            cluster.backend_state_change_proxies().await;
            cluster.send_alert(url, prev_state, ServerState::StandAlone).await;
        }
    }
}

/// Failed-slave policy: run the operator error script, then skip one binlog
/// event and restart the slave thread when the last SQL error matches the
/// configured pattern.
pub async fn process_failed_slave(cluster: &Cluster, idx: usize) -> Result<()> {
    let (state, prev_state, url, conn, channel, sql_running, last_sql_error) = {
        let server = cluster.servers[idx].read().await;
        (
            server.state,
            server.prev_state,
            server.url.clone(),
            server.conn.clone(),
            server.replication_source_name.clone(),
            server.has_replication_sql_thread_running(),
            server
                .slave_status()
                .map(|ss| ss.last_sql_error.clone())
                .unwrap_or_default(),
        )
    };

    if state != ServerState::SlaveErr {
        return Ok(());
    }

    if let Some(script) = &cluster.conf.failover.replication_error_script {
        info!(cluster = %cluster.name, "Calling replication error script");
        let output = tokio::process::Command::new(script)
            .arg(&url)
            .arg(prev_state.to_string())
            .arg(state.to_string())
            .output()
            .await;
        match output {
            Ok(out) => info!(
                cluster = %cluster.name,
                "Replication error script complete: {}",
                String::from_utf8_lossy(&out.stdout)
            ),
            Err(e) => warn!(cluster = %cluster.name, error = %e, "Replication error script failed"),
        }
    }

    if sql_running {
        if let Some(pattern) = &cluster.conf.failover.replication_restart_on_sql_error_match {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&last_sql_error) => {
                    info!(
                        cluster = %cluster.name,
                        pattern = %pattern,
                        error = %last_sql_error,
                        "Skip event and restart slave on {}",
                        url
                    );
                    if let Some(conn) = conn {
                        conn.stop_slave(&channel).await?;
                        conn.skip_replication_event(&channel).await?;
                        conn.start_slave(&channel).await?;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    cluster = %cluster.name,
                    error = %e,
                    "Bad replication-restart-on-sqlerror-match pattern"
                ),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::Config;
    use crate::db::simulator::SimFleet;
    use tempfile::TempDir;

    async fn sim_cluster(tmp: &TempDir, max_fail: u32) -> (SimFleet, Arc<Cluster>) {
        let fleet = SimFleet::new();
        fleet.add_server("127.0.0.1", 3306, "10.5.9-MariaDB-log");
        fleet.add_server("127.0.0.1", 3307, "10.5.9-MariaDB-log");
        fleet.add_server("127.0.0.1", 3308, "10.5.9-MariaDB-log");

        let mut conf = Config::development();
        conf.cluster.working_dir = tmp.path().to_path_buf();
        conf.monitoring.max_fail = max_fail;
        conf.failover.autorejoin = false;
        let cluster = Cluster::new(Arc::new(conf), fleet.connector()).unwrap();
        (fleet, cluster)
    }

    #[tokio::test]
    async fn test_first_probe_adopts_connection() {
        let tmp = TempDir::new().unwrap();
        let (_fleet, cluster) = sim_cluster(&tmp, 3).await;

        probe(&cluster, 0).await;
        assert!(cluster.servers[0].read().await.conn.is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_sets_error_auth() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, 3).await;
        fleet
            .handle("127.0.0.1", 3306)
            .unwrap()
            .set_auth_fail(true);

        probe(&cluster, 0).await;
        let server = cluster.servers[0].read().await;
        assert_eq!(server.state, ServerState::ErrorAuth);
        assert_eq!(server.fail_count, 0);
        assert!(cluster.sme.has_state("ERR00004"));
    }

    #[tokio::test]
    async fn test_suspect_then_failed_at_threshold() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, 3).await;
        let handle = fleet.handle("127.0.0.1", 3307).unwrap();
        handle.set_unreachable(true);

        for expected_state in [
            ServerState::Suspect,
            ServerState::Suspect,
            ServerState::Failed,
        ] {
            cluster.sme.heartbeat();
            probe(&cluster, 1).await;
            assert_eq!(cluster.servers[1].read().await.state, expected_state);
        }
        assert_eq!(cluster.servers[1].read().await.fail_count, 3);
    }

    #[tokio::test]
    async fn test_failed_slave_ejected_and_replications_preserved() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, 2).await;

        // Pretend server 1 was a live slave.
        {
            let mut server = cluster.servers[1].write().await;
            server.replications = vec![crate::db::SlaveStatus {
                master_host: "127.0.0.1".to_string(),
                master_port: 3306,
                ..Default::default()
            }];
            server.state = ServerState::Slave;
            server.prev_state = ServerState::Slave;
        }
        cluster
            .set_pointers(crate::topology::TopologyPointers {
                master: Some(0),
                vmaster: None,
                slaves: vec![1, 2],
            })
            .await;

        fleet
            .handle("127.0.0.1", 3307)
            .unwrap()
            .set_unreachable(true);
        for _ in 0..2 {
            cluster.sme.heartbeat();
            probe(&cluster, 1).await;
        }

        let server = cluster.servers[1].read().await;
        assert_eq!(server.state, ServerState::Failed);
        assert!(server.replications.is_empty());
        assert_eq!(server.last_seen_replications.len(), 1);
        assert_eq!(cluster.slave_indices().await, vec![2]);
    }

    #[tokio::test]
    async fn test_fail_count_resets_on_recovery() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, 5).await;
        let handle = fleet.handle("127.0.0.1", 3306).unwrap();

        // Adopt a persistent connection first.
        probe(&cluster, 0).await;

        handle.set_unreachable(true);
        cluster.sme.heartbeat();
        probe(&cluster, 0).await;
        assert_eq!(cluster.servers[0].read().await.fail_count, 1);
        assert_eq!(cluster.servers[0].read().await.state, ServerState::Suspect);

        handle.set_unreachable(false);
        cluster.sme.heartbeat();
        probe(&cluster, 0).await;
        assert_eq!(
            cluster.servers[0].read().await.state,
            ServerState::StandAlone
        );

        // The counter clears on the next tick, once the state has left the
        // unavailable set.
        cluster.sme.heartbeat();
        probe(&cluster, 0).await;
        assert_eq!(cluster.servers[0].read().await.fail_count, 0);
    }

    #[tokio::test]
    async fn test_suspect_master_state_recorded_at_first_failure() {
        let tmp = TempDir::new().unwrap();
        let (fleet, cluster) = sim_cluster(&tmp, 3).await;
        cluster
            .set_pointers(crate::topology::TopologyPointers {
                master: Some(0),
                vmaster: None,
                slaves: vec![],
            })
            .await;

        fleet
            .handle("127.0.0.1", 3306)
            .unwrap()
            .set_unreachable(true);
        cluster.sme.heartbeat();
        cluster.sme.heartbeat();
        probe(&cluster, 0).await;

        let server = cluster.servers[0].read().await;
        assert_eq!(server.state, ServerState::Suspect);
        assert_eq!(server.fail_suspect_heartbeat, 2);
    }
}

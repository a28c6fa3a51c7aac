//! Provisioning: drive the orchestrator for every declared server and
//! proxy through the cluster's single completion channel.
//!
//! The pattern is a barrier: launch one job per service in sequence, then
//! read exactly one completion per launched job. Orchestrator failures are
//! logged and the remaining jobs continue; cookies record what succeeded.

use crate::cluster::{Cluster, JobResult};
use crate::error::{RepmanError, Result};
use crate::events::{Event, EventType};
use crate::orchestrator::ServiceSpec;
use crate::server::ServerState;
use crate::snapshot;
use crate::state::FailoverGate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

async fn database_spec(cluster: &Cluster, idx: usize) -> ServiceSpec {
    let server = cluster.servers[idx].read().await;
    ServiceSpec {
        service_name: server.service_name.clone(),
        host: server.host.clone(),
        port: server.port,
        datadir: server.datadir.clone(),
    }
}

async fn proxy_spec(cluster: &Cluster, idx: usize) -> ServiceSpec {
    let proxy = cluster.proxies[idx].read().await;
    ServiceSpec {
        service_name: proxy.service_name.clone(),
        host: proxy.host.clone(),
        port: proxy.port,
        datadir: proxy.datadir.clone(),
    }
}

/// Provision every declared database and proxy.
pub async fn provision_all(cluster: &Cluster) -> Result<()> {
    let _gate = FailoverGate::acquire(&cluster.sme)?;

    // A rebuilt fleet starts from a clean snapshot.
    snapshot::remove(cluster);

    // Databases: launch N, await N.
    for idx in 0..cluster.servers.len() {
        let spec = database_spec(cluster, idx).await;
        let orchestrator = Arc::clone(&cluster.orchestrator);
        let tx = cluster.completion_sender();
        tokio::spawn(async move {
            let result = orchestrator.provision_database(&spec).await;
            let _ = tx
                .send(JobResult {
                    service: spec.service_name,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }
    let results = cluster.await_jobs(cluster.servers.len()).await;
    for result in &results {
        match &result.error {
            Some(err) => {
                error!(cluster = %cluster.name, service = %result.service, error = %err, "Provisioning error");
            }
            None => {
                info!(cluster = %cluster.name, service = %result.service, "Provisioning done for database");
                if let Some(idx) = index_of_service(cluster, &result.service).await {
                    let server = cluster.servers[idx].read().await;
                    server.set_provision_cookie();
                    server.del_reprovision_cookie();
                    server.del_restart_cookie();
                    drop(server);
                    cluster.servers[idx].write().await.state = ServerState::Provision;
                }
            }
        }
    }

    // Proxies.
    for idx in 0..cluster.proxies.len() {
        let spec = proxy_spec(cluster, idx).await;
        let orchestrator = Arc::clone(&cluster.orchestrator);
        let tx = cluster.completion_sender();
        tokio::spawn(async move {
            let result = orchestrator.provision_proxy(&spec).await;
            let _ = tx
                .send(JobResult {
                    service: spec.service_name,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }
    let results = cluster.await_jobs(cluster.proxies.len()).await;
    for result in &results {
        match &result.error {
            Some(err) => {
                error!(cluster = %cluster.name, service = %result.service, error = %err, "Provisioning proxy error");
            }
            None => {
                info!(cluster = %cluster.name, service = %result.service, "Provisioning done for proxy");
                for proxy in &cluster.proxies {
                    let proxy = proxy.read().await;
                    if proxy.service_name == result.service {
                        proxy.set_provision_cookie();
                    }
                }
            }
        }
    }

    cluster
        .events
        .publish(Event::new(
            EventType::ServerProvisioned,
            &cluster.name,
            None,
            "Provisioning completed",
        ))
        .await;
    Ok(())
}

/// Unprovision everything, clear pointers and cookies, mark undiscovered.
pub async fn unprovision_all(cluster: &Cluster) -> Result<()> {
    let _gate = FailoverGate::acquire(&cluster.sme)?;

    for idx in 0..cluster.servers.len() {
        let spec = database_spec(cluster, idx).await;
        let orchestrator = Arc::clone(&cluster.orchestrator);
        let tx = cluster.completion_sender();
        tokio::spawn(async move {
            let result = orchestrator.unprovision_database(&spec).await;
            let _ = tx
                .send(JobResult {
                    service: spec.service_name,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }
    for result in cluster.await_jobs(cluster.servers.len()).await {
        match &result.error {
            Some(err) => {
                error!(cluster = %cluster.name, service = %result.service, error = %err, "Unprovision error");
            }
            None => {
                info!(cluster = %cluster.name, service = %result.service, "Unprovision done for database");
                if let Some(idx) = index_of_service(cluster, &result.service).await {
                    cluster.servers[idx].read().await.clear_all_cookies();
                }
            }
        }
    }

    for idx in 0..cluster.proxies.len() {
        let spec = proxy_spec(cluster, idx).await;
        let orchestrator = Arc::clone(&cluster.orchestrator);
        let tx = cluster.completion_sender();
        tokio::spawn(async move {
            let result = orchestrator.unprovision_proxy(&spec).await;
            let _ = tx
                .send(JobResult {
                    service: spec.service_name,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }
    for result in cluster.await_jobs(cluster.proxies.len()).await {
        match &result.error {
            Some(err) => {
                error!(cluster = %cluster.name, service = %result.service, error = %err, "Unprovision proxy error");
            }
            None => {
                for proxy in &cluster.proxies {
                    let proxy = proxy.read().await;
                    if proxy.service_name == result.service {
                        proxy.clear_all_cookies();
                    }
                }
            }
        }
    }

    cluster.clear_pointers().await;
    cluster.sme.undiscovered();
    cluster
        .events
        .publish(Event::new(
            EventType::ServerUnprovisioned,
            &cluster.name,
            None,
            "Unprovision completed",
        ))
        .await;
    Ok(())
}

/// Start one database service through the orchestrator.
pub async fn start_database(cluster: &Cluster, idx: usize) -> Result<()> {
    let spec = database_spec(cluster, idx).await;
    info!(cluster = %cluster.name, service = %spec.service_name, "Starting database service");
    cluster.orchestrator.start_database(&spec).await?;
    cluster.servers[idx].read().await.del_restart_cookie();
    Ok(())
}

/// Stop one database service through the orchestrator.
pub async fn stop_database(cluster: &Cluster, idx: usize) -> Result<()> {
    let spec = database_spec(cluster, idx).await;
    info!(cluster = %cluster.name, service = %spec.service_name, "Stopping database service");
    cluster.orchestrator.stop_database(&spec).await?;
    cluster.servers[idx].read().await.del_restart_cookie();
    Ok(())
}

/// Shut one database down over SQL, waiting for slaves on a recent MariaDB.
pub async fn shutdown_database(cluster: &Cluster, idx: usize) -> Result<()> {
    let conn = cluster.servers[idx].read().await.conn()?;
    conn.shutdown_server(true).await?;
    cluster.servers[idx].read().await.del_restart_cookie();
    Ok(())
}

/// Poll until every declared server accepts connections.
pub async fn wait_database_can_conn(cluster: &Cluster) -> Result<()> {
    const ATTEMPTS: u32 = 30;
    for _ in 0..ATTEMPTS {
        let mut all_up = true;
        for server in &cluster.servers {
            let (host, port) = {
                let server = server.read().await;
                (server.host.clone(), server.port)
            };
            if cluster
                .connector
                .connect(&host, port, &cluster.conf.replication.monitor_credentials)
                .await
                .is_err()
            {
                all_up = false;
                break;
            }
        }
        if all_up {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Err(RepmanError::WaitTimeout(
        "for all databases to accept connections".to_string(),
    ))
}

async fn index_of_service(cluster: &Cluster, service: &str) -> Option<usize> {
    for (idx, server) in cluster.servers.iter().enumerate() {
        if server.read().await.service_name == service {
            return Some(idx);
        }
    }
    None
}

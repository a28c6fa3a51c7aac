//! Operator-triggered capture mode.
//!
//! Samples processlist, InnoDB status, global status and per-channel
//! replication status into a JSON artifact at high frequency for a few
//! heartbeats, for post-mortem analysis of a degrading server.

use crate::cluster::Cluster;
use crate::error::Result;
use crate::events::{Event, EventType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One capture sample set.
#[derive(Debug, Serialize, Deserialize)]
struct CaptureSave {
    processlist: Vec<crate::db::ProcessEntry>,
    innodbstatus: String,
    status: std::collections::HashMap<String, String>,
    slavestatus: Vec<crate::db::SlaveStatus>,
}

/// Heartbeats the capture loop spans.
const CAPTURE_HEARTBEATS: u64 = 5;
/// Sampling period inside the loop.
const CAPTURE_INTERVAL: Duration = Duration::from_millis(40);

/// Start capture mode on one server. Returns immediately; the loop runs as
/// a background task until the heartbeat counter advances past the window.
pub async fn start(cluster: &Arc<Cluster>, idx: usize) -> Result<()> {
    {
        let mut server = cluster.servers[idx].write().await;
        if server.in_capture_mode {
            return Ok(());
        }
        server.in_capture_mode = true;
    }

    let url = cluster.servers[idx].read().await.url.clone();
    cluster
        .events
        .publish(Event::new(
            EventType::CaptureStarted,
            &cluster.name,
            Some(url),
            "Capture mode started",
        ))
        .await;

    let cluster = Arc::clone(cluster);
    let start_heartbeat = cluster.sme.heartbeats();
    tokio::spawn(async move {
        capture_loop(cluster, idx, start_heartbeat).await;
    });
    Ok(())
}

async fn capture_loop(cluster: Arc<Cluster>, idx: usize, start_heartbeat: u64) {
    let (name, conn) = {
        let server = cluster.servers[idx].read().await;
        (server.name.clone(), server.conn.clone())
    };
    let Some(conn) = conn else {
        cluster.servers[idx].write().await.in_capture_mode = false;
        return;
    };

    let dir = cluster
        .conf
        .cluster
        .working_dir
        .join(&cluster.name);
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let path = dir.join(format!("capture_{}_{}.json", name, stamp));
    info!(cluster = %cluster.name, path = %path.display(), "Capture loop running");

    loop {
        let save = CaptureSave {
            processlist: conn.get_processlist().await.unwrap_or_default(),
            innodbstatus: conn.get_innodb_status().await.unwrap_or_default(),
            status: conn.get_status().await.unwrap_or_default(),
            slavestatus: conn.get_all_slave_status().await.unwrap_or_default(),
        };

        match serde_json::to_vec_pretty(&save) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    warn!(path = %path.display(), error = %e, "Could not write capture artifact");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not serialize capture sample");
                break;
            }
        }

        if cluster.sme.heartbeats() >= start_heartbeat + CAPTURE_HEARTBEATS {
            break;
        }
        tokio::time::sleep(CAPTURE_INTERVAL).await;
    }

    cluster.servers[idx].write().await.in_capture_mode = false;
    purge(&dir, &name, cluster.conf.monitoring.capture_file_keep).await;
}

/// Keep only the newest `keep` capture artifacts for one server.
async fn purge(dir: &std::path::Path, server_name: &str, keep: usize) {
    let prefix = format!("capture_{}_", server_name);
    let mut files = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    if files.len() > keep {
        let excess = files.len() - keep;
        for path in files.into_iter().take(excess) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

//! Cluster management: the named group of declared servers and proxies
//! sharing one configuration.
//!
//! The cluster owns the ordered server table (order is significant: index 0
//! is the preferred master under some topologies), the derived topology
//! pointers, the state machine, and the single completion channel shared by
//! orchestrator jobs. Pointer writes happen only under the failover gate or
//! from topology discovery outside failover.

pub mod bootstrap;
pub mod failover;
pub mod provision;

use crate::config::Config;
use crate::db::Connector;
use crate::error::{RepmanError, Result};
use crate::events::{Event, EventBus, EventType};
use crate::orchestrator::{self, Orchestrator};
use crate::server::{monitor, ServerMonitor, ServerRef, ServerState};
use crate::shutdown::ShutdownCoordinator;
use crate::snapshot;
use crate::state::StateMachine;
use crate::topology::{self, TopologyPointers};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Result of one orchestrator job, reported on the completion channel.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub service: String,
    /// None on success.
    pub error: Option<String>,
}

/// One declared proxy instance. The proxy data plane is out of scope; the
/// cluster only provisions it and notifies it of backend changes.
pub struct Proxy {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub service_name: String,
    pub datadir: PathBuf,
}

pub type ProxyRef = Arc<RwLock<Proxy>>;

impl Proxy {
    pub fn new(conf: &Config, url: &str) -> Result<Self> {
        let (host, port) = crate::config::split_host_port(url)
            .ok_or_else(|| RepmanError::Config(format!("Invalid proxy URL: {}", url)))?;
        let datadir = conf
            .cluster
            .working_dir
            .join(&conf.cluster.name)
            .join(format!("{}_{}", host, port));
        std::fs::create_dir_all(&datadir)?;
        Ok(Self {
            name: host.clone(),
            service_name: format!("{}/svc/{}", conf.cluster.name, host),
            url: format!("{}:{}", host, port),
            host,
            port,
            datadir,
        })
    }

    pub fn set_provision_cookie(&self) {
        let _ = crate::server::cookies::set(&self.datadir, crate::server::cookies::Cookie::Provision);
    }

    pub fn del_provision_cookie(&self) {
        let _ =
            crate::server::cookies::clear(&self.datadir, crate::server::cookies::Cookie::Provision);
    }

    pub fn clear_all_cookies(&self) {
        crate::server::cookies::clear_all(&self.datadir);
    }
}

/// A named cluster under management.
pub struct Cluster {
    pub name: String,
    pub conf: Arc<Config>,
    pub sme: Arc<StateMachine>,
    pub events: EventBus,
    /// Declared servers, in configuration order.
    pub servers: Vec<ServerRef>,
    pub proxies: Vec<ProxyRef>,
    pub connector: Arc<dyn Connector>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub http: reqwest::Client,

    topo: RwLock<TopologyPointers>,
    jobs_tx: mpsc::Sender<JobResult>,
    jobs_rx: Mutex<mpsc::Receiver<JobResult>>,
    active: AtomicBool,
}

impl Cluster {
    /// Build a cluster from configuration. The orchestrator variant is
    /// dispatched here, once, not per call.
    pub fn new(conf: Arc<Config>, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        conf.validate()?;

        let mut servers = Vec::with_capacity(conf.cluster.servers.len());
        for url in &conf.cluster.servers {
            servers.push(Arc::new(RwLock::new(ServerMonitor::new(&conf, url)?)));
        }
        let mut proxies = Vec::with_capacity(conf.cluster.proxies.len());
        for url in &conf.cluster.proxies {
            proxies.push(Arc::new(RwLock::new(Proxy::new(&conf, url)?)));
        }

        let orchestrator = orchestrator::build(&conf.provisioning);
        let (jobs_tx, jobs_rx) = mpsc::channel(servers.len() + proxies.len() + 4);

        Ok(Arc::new(Self {
            name: conf.cluster.name.clone(),
            sme: Arc::new(StateMachine::new()),
            events: EventBus::default(),
            servers,
            proxies,
            connector,
            orchestrator,
            http: reqwest::Client::new(),
            topo: RwLock::new(TopologyPointers::default()),
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
            active: AtomicBool::new(true),
            conf,
        }))
    }

    /// Run the monitor loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        let mut ticker = tokio::time::interval(self.conf.monitoring.ticker);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown.subscribe();

        info!(cluster = %self.name, "Monitor loop starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!(cluster = %self.name, "Monitor loop shutting down");
                    break;
                }
            }
        }
    }

    /// One monitoring tick: rotate sticky codes, advance the heartbeat,
    /// probe every server, re-derive topology, and fire automatic failover
    /// when armed.
    pub async fn tick(&self) {
        self.sme.rotate();
        let heartbeat = self.sme.heartbeat();
        debug!(cluster = %self.name, heartbeat, "Monitoring tick");

        let probes: Vec<_> = (0..self.servers.len())
            .map(|idx| monitor::probe(self, idx))
            .collect();
        futures::future::join_all(probes).await;

        if !self.sme.is_in_failover() {
            match topology::discover(self).await {
                Ok(()) => {
                    if let Err(e) = snapshot::write(self).await {
                        warn!(cluster = %self.name, error = %e, "Could not write cluster snapshot");
                    }
                }
                Err(e) => {
                    debug!(cluster = %self.name, error = %e, "Topology discovery failed");
                }
            }
        }

        if self.conf.failover.mode == crate::config::FailoverMode::Automatic {
            self.check_auto_failover().await;
        }
    }

    async fn check_auto_failover(&self) {
        if self.sme.is_in_failover() {
            return;
        }
        let master_failed = match self.master_index().await {
            Some(idx) => self.servers[idx].read().await.is_failed(),
            None => false,
        };
        if master_failed {
            info!(cluster = %self.name, "Master is failed, triggering automatic failover");
            if let Err(e) = failover::master_failover(self).await {
                error!(cluster = %self.name, error = %e, "Automatic failover failed");
            }
        }
    }

    // Topology pointers. Writers hold the failover gate or run from
    // discovery outside failover; readers may observe a stale value.

    pub async fn pointers(&self) -> TopologyPointers {
        self.topo.read().await.clone()
    }

    pub(crate) async fn set_pointers(&self, pointers: TopologyPointers) {
        *self.topo.write().await = pointers;
    }

    pub(crate) async fn clear_pointers(&self) {
        *self.topo.write().await = TopologyPointers::default();
    }

    pub async fn master_index(&self) -> Option<usize> {
        self.topo.read().await.master
    }

    pub async fn master(&self) -> Option<ServerRef> {
        let idx = self.master_index().await?;
        Some(Arc::clone(&self.servers[idx]))
    }

    pub async fn vmaster_index(&self) -> Option<usize> {
        self.topo.read().await.vmaster
    }

    pub async fn slave_indices(&self) -> Vec<usize> {
        self.topo.read().await.slaves.clone()
    }

    /// Eject a server from the slaves list (it crossed the failure
    /// threshold).
    pub(crate) async fn remove_from_slaves(&self, idx: usize) {
        self.topo.write().await.slaves.retain(|&s| s != idx);
    }

    pub async fn index_of_url(&self, url: &str) -> Option<usize> {
        for (idx, server) in self.servers.iter().enumerate() {
            if server.read().await.url == url {
                return Some(idx);
            }
        }
        None
    }

    /// Whether this manager is actively driving the cluster (as opposed to
    /// a standby observer).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Apply the read-only discipline to one server if configuration and
    /// discovery state require it.
    pub async fn apply_read_only_if_required(&self, idx: usize) {
        if !self.conf.topology.read_only || !self.sme.is_discovered() {
            return;
        }
        let master_idx = self.master_index().await;
        if master_idx.is_none() || master_idx == Some(idx) {
            return;
        }
        let (conn, url) = {
            let server = self.servers[idx].read().await;
            if server.have_wsrep || self.conf.is_ignored_readonly(&server.url) {
                return;
            }
            (server.conn.clone(), server.url.clone())
        };
        if let Some(conn) = conn {
            info!(cluster = %self.name, server = %url, "Setting read only on unconnected server");
            if let Err(e) = conn.set_read_only(true).await {
                warn!(server = %url, error = %e, "Could not set read only");
            }
        }
    }

    /// Notify proxy backends that a server state changed.
    pub async fn backend_state_change_proxies(&self) {
        for proxy in &self.proxies {
            let proxy = proxy.read().await;
            debug!(cluster = %self.name, proxy = %proxy.url, "Notifying proxy of backend state change");
        }
    }

    /// Publish a state-change alert for one server.
    pub async fn send_alert(&self, url: &str, prev: ServerState, new: ServerState) {
        self.events
            .publish(Event::new(
                EventType::ServerStateChanged,
                &self.name,
                Some(url.to_string()),
                format!("Server {} state changed from {} to {}", url, prev, new),
            ))
            .await;
    }

    // Completion channel: one writer per launched job, exactly one reader
    // per operation.

    pub(crate) fn completion_sender(&self) -> mpsc::Sender<JobResult> {
        self.jobs_tx.clone()
    }

    /// Await exactly `count` job results. The caller must have launched the
    /// matching number of jobs; one stray send corrupts the next operation.
    pub(crate) async fn await_jobs(&self, count: usize) -> Vec<JobResult> {
        let mut rx = self.jobs_rx.lock().await;
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            match rx.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
        results
    }
}

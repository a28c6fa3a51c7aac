//! Topology discovery: derive master/vmaster/slaves pointers from the
//! current per-server states and the replication graph.
//!
//! Discovery is the only component besides the gated controllers allowed to
//! rewrite the topology pointers, and it refuses to run while the failover
//! gate is held. Its error is also a signal: bootstrap interprets a
//! discovery failure as "empty environment".

use crate::cluster::Cluster;
use crate::error::{RepmanError, Result};
use crate::server::ServerState;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Supported topology kinds, derived from configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    MasterSlave,
    MultiTierSlave,
    #[serde(rename = "multi-master-2node")]
    MultiMaster2Node,
    MultiMasterRing,
    MultiMasterWsrep,
    MaxscaleBinlog,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyKind::MasterSlave => "master-slave",
            TopologyKind::MultiTierSlave => "multi-tier-slave",
            TopologyKind::MultiMaster2Node => "multi-master-2node",
            TopologyKind::MultiMasterRing => "multi-master-ring",
            TopologyKind::MultiMasterWsrep => "multi-master-wsrep",
            TopologyKind::MaxscaleBinlog => "maxscale-binlog",
        };
        f.write_str(s)
    }
}

/// Derived cluster pointers. Indices refer to the cluster's server table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyPointers {
    pub master: Option<usize>,
    /// Virtual master for wsrep/ring; used only for read/write routing.
    pub vmaster: Option<usize>,
    pub slaves: Vec<usize>,
}

/// Per-server facts needed by discovery, snapshotted under a short lock.
struct ServerFacts {
    idx: usize,
    state: ServerState,
    ignored: bool,
    read_only: bool,
    have_wsrep: bool,
    is_wsrep_primary: bool,
    host: String,
    port: u16,
    /// Live replication sources as (host, port).
    sources: Vec<(String, u16)>,
}

impl ServerFacts {
    fn usable(&self) -> bool {
        !matches!(
            self.state,
            ServerState::Failed | ServerState::ErrorAuth | ServerState::Maintenance
        )
    }
}

/// Re-derive the topology pointers for the cluster.
///
/// Fails when the topology is ambiguous (two masters in a single-master
/// kind) or when no master can be elected.
pub async fn discover(cluster: &Cluster) -> Result<()> {
    if cluster.sme.is_in_failover() {
        return Err(RepmanError::FailoverInProgress);
    }

    let mut facts = Vec::with_capacity(cluster.servers.len());
    for (idx, server) in cluster.servers.iter().enumerate() {
        let server = server.read().await;
        facts.push(ServerFacts {
            idx,
            state: server.state,
            ignored: server.ignored,
            read_only: server.read_only,
            have_wsrep: server.have_wsrep,
            is_wsrep_primary: server.is_wsrep_primary,
            host: server.host.clone(),
            port: server.port,
            sources: server
                .replications
                .iter()
                .map(|ss| (ss.master_host.clone(), ss.master_port))
                .collect(),
        });
    }

    let kind = cluster.conf.topology_kind();
    let pointers = match kind {
        TopologyKind::MultiMasterWsrep => discover_wsrep(&facts)?,
        TopologyKind::MultiMasterRing => discover_ring(&facts)?,
        TopologyKind::MultiMaster2Node => discover_two_node(&facts)?,
        _ => discover_master_slave(&facts)?,
    };

    // Commit roles back onto the servers.
    for fact in &facts {
        let mut server = cluster.servers[fact.idx].write().await;
        if pointers.master == Some(fact.idx) {
            if !server.is_down() && !server.state.is_relay_like() {
                server.state = if pointers.slaves.is_empty() && kind == TopologyKind::MasterSlave {
                    ServerState::MasterAlone
                } else if kind == TopologyKind::MultiMasterWsrep {
                    server.state
                } else {
                    ServerState::Master
                };
            }
        }
        server.is_virtual_master = pointers.vmaster == Some(fact.idx);
        // A relay is a slave other servers replicate from.
        let is_relay = pointers.slaves.contains(&fact.idx)
            && facts.iter().any(|other| {
                other.idx != fact.idx
                    && other
                        .sources
                        .iter()
                        .any(|(h, p)| *h == fact.host && *p == fact.port)
            });
        server.is_relay = is_relay;
        if is_relay && server.state == ServerState::Slave {
            server.state = ServerState::Relay;
        }
    }

    debug!(
        cluster = %cluster.name,
        kind = %kind,
        master = ?pointers.master,
        slaves = ?pointers.slaves,
        "Topology discovered"
    );

    cluster.set_pointers(pointers).await;
    cluster.sme.set_discovered();
    Ok(())
}

fn slave_indices(facts: &[ServerFacts]) -> Vec<usize> {
    facts
        .iter()
        .filter(|f| f.state.is_slave_like() || f.state.is_relay_like())
        .filter(|f| !f.ignored)
        .map(|f| f.idx)
        .collect()
}

/// Simple and multi-tier kinds: the unique non-replicating reachable
/// server is the master.
fn discover_master_slave(facts: &[ServerFacts]) -> Result<TopologyPointers> {
    let masters: Vec<&ServerFacts> = facts
        .iter()
        .filter(|f| f.usable() && f.sources.is_empty() && !f.ignored)
        .filter(|f| {
            // A fresh StandAlone fleet has no master yet; only count servers
            // that either already classify as master or have live slaves.
            f.state == ServerState::Master
                || f.state == ServerState::MasterAlone
                || facts.iter().any(|other| {
                    other
                        .sources
                        .iter()
                        .any(|(h, p)| *h == f.host && *p == f.port)
                })
        })
        .collect();

    match masters.len() {
        0 => Err(RepmanError::NoMaster),
        1 => Ok(TopologyPointers {
            master: Some(masters[0].idx),
            vmaster: None,
            slaves: slave_indices(facts),
        }),
        n => Err(RepmanError::MultipleMasters { count: n }),
    }
}

/// Ring: every node replicates; the writable node is elected master and
/// doubles as the virtual master.
fn discover_ring(facts: &[ServerFacts]) -> Result<TopologyPointers> {
    let writable: Vec<&ServerFacts> = facts
        .iter()
        .filter(|f| f.usable() && !f.sources.is_empty() && !f.read_only)
        .collect();

    let master = writable
        .first()
        .map(|f| f.idx)
        .ok_or(RepmanError::NoMaster)?;
    Ok(TopologyPointers {
        master: Some(master),
        vmaster: Some(master),
        slaves: slave_indices(facts),
    })
}

/// Two-node active-active: the writable node leads; with both read-only
/// (the conservative bootstrap default) the first replicating node does.
fn discover_two_node(facts: &[ServerFacts]) -> Result<TopologyPointers> {
    let replicating: Vec<&ServerFacts> = facts
        .iter()
        .filter(|f| f.usable() && !f.sources.is_empty())
        .collect();
    if replicating.is_empty() {
        return Err(RepmanError::NoMaster);
    }

    let master = replicating
        .iter()
        .find(|f| !f.read_only)
        .or_else(|| replicating.first())
        .map(|f| f.idx)
        .ok_or(RepmanError::NoMaster)?;
    let vmaster = replicating
        .iter()
        .map(|f| f.idx)
        .find(|&idx| idx != master);

    Ok(TopologyPointers {
        master: Some(master),
        vmaster,
        slaves: facts
            .iter()
            .filter(|f| (f.state.is_slave_like() || f.state.is_relay_like()) && !f.ignored)
            .map(|f| f.idx)
            .filter(|&idx| idx != master)
            .collect(),
    })
}

/// Synchronous multi-master: any number of writable primaries; the first
/// synced primary is the routing master.
fn discover_wsrep(facts: &[ServerFacts]) -> Result<TopologyPointers> {
    let primary = facts
        .iter()
        .filter(|f| f.usable() && f.have_wsrep && f.is_wsrep_primary)
        .find(|f| !f.read_only)
        .or_else(|| {
            facts
                .iter()
                .find(|f| f.usable() && f.have_wsrep && f.is_wsrep_primary)
        })
        .map(|f| f.idx)
        .ok_or(RepmanError::NoMaster)?;

    Ok(TopologyPointers {
        master: Some(primary),
        vmaster: Some(primary),
        slaves: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(idx: usize, state: ServerState, sources: Vec<(&str, u16)>) -> ServerFacts {
        ServerFacts {
            idx,
            state,
            ignored: false,
            read_only: false,
            have_wsrep: false,
            is_wsrep_primary: false,
            host: format!("db{}", idx),
            port: 3306,
            sources: sources
                .into_iter()
                .map(|(h, p)| (h.to_string(), p))
                .collect(),
        }
    }

    #[test]
    fn test_master_slave_discovery() {
        let facts = vec![
            fact(0, ServerState::StandAlone, vec![]),
            fact(1, ServerState::Slave, vec![("db0", 3306)]),
            fact(2, ServerState::Slave, vec![("db0", 3306)]),
        ];
        let pointers = discover_master_slave(&facts).unwrap();
        assert_eq!(pointers.master, Some(0));
        assert_eq!(pointers.slaves, vec![1, 2]);
    }

    #[test]
    fn test_no_master_in_empty_environment() {
        let facts = vec![
            fact(0, ServerState::StandAlone, vec![]),
            fact(1, ServerState::StandAlone, vec![]),
        ];
        assert!(matches!(
            discover_master_slave(&facts),
            Err(RepmanError::NoMaster)
        ));
    }

    #[test]
    fn test_two_masters_is_ambiguous() {
        let facts = vec![
            fact(0, ServerState::Master, vec![]),
            fact(1, ServerState::Master, vec![]),
            fact(2, ServerState::Slave, vec![("db0", 3306)]),
        ];
        assert!(matches!(
            discover_master_slave(&facts),
            Err(RepmanError::MultipleMasters { count: 2 })
        ));
    }

    #[test]
    fn test_failed_master_is_not_elected() {
        let facts = vec![
            fact(0, ServerState::Failed, vec![]),
            fact(1, ServerState::Slave, vec![("db0", 3306)]),
        ];
        assert!(discover_master_slave(&facts).is_err());
    }

    #[test]
    fn test_ignored_slave_excluded_from_list() {
        let mut facts = vec![
            fact(0, ServerState::Master, vec![]),
            fact(1, ServerState::Slave, vec![("db0", 3306)]),
            fact(2, ServerState::Slave, vec![("db0", 3306)]),
        ];
        facts[2].ignored = true;
        let pointers = discover_master_slave(&facts).unwrap();
        assert_eq!(pointers.slaves, vec![1]);
    }

    #[test]
    fn test_ring_elects_writable_node() {
        let mut facts = vec![
            fact(0, ServerState::Slave, vec![("db2", 3306)]),
            fact(1, ServerState::Slave, vec![("db0", 3306)]),
            fact(2, ServerState::Slave, vec![("db1", 3306)]),
        ];
        facts[0].read_only = false;
        facts[1].read_only = true;
        facts[2].read_only = true;
        let pointers = discover_ring(&facts).unwrap();
        assert_eq!(pointers.master, Some(0));
        assert_eq!(pointers.vmaster, Some(0));
        assert_eq!(pointers.slaves.len(), 3);
    }

    #[test]
    fn test_two_node_conservative_default() {
        let mut facts = vec![
            fact(0, ServerState::Slave, vec![("db1", 3306)]),
            fact(1, ServerState::Slave, vec![("db0", 3306)]),
        ];
        facts[0].read_only = true;
        facts[1].read_only = true;
        let pointers = discover_two_node(&facts).unwrap();
        assert_eq!(pointers.master, Some(0));
        assert_eq!(pointers.vmaster, Some(1));
    }

    #[test]
    fn test_wsrep_elects_primary() {
        let mut facts = vec![
            fact(0, ServerState::Wsrep, vec![]),
            fact(1, ServerState::Wsrep, vec![]),
        ];
        for f in &mut facts {
            f.have_wsrep = true;
            f.is_wsrep_primary = true;
        }
        facts[0].read_only = true;
        let pointers = discover_wsrep(&facts).unwrap();
        assert_eq!(pointers.master, Some(1));
        assert!(pointers.slaves.is_empty());
    }

    #[test]
    fn test_kind_display_tokens() {
        assert_eq!(TopologyKind::MasterSlave.to_string(), "master-slave");
        assert_eq!(
            TopologyKind::MultiMaster2Node.to_string(),
            "multi-master-2node"
        );
        assert_eq!(
            TopologyKind::MultiMasterWsrep.to_string(),
            "multi-master-wsrep"
        );
    }
}

//! Bootstrap integration tests
//!
//! Exercises topology wiring over a simulated fleet: master/slave,
//! multi-tier, ring, two-node, plus cleanup idempotency and unprovision.

#[allow(dead_code)]
mod common;

use common::cluster_sim::ClusterBuilder;
use repman::cluster::{bootstrap, provision};
use repman::db::MasterUseGtid;
use repman::server::cookies::{self, Cookie};
use repman::server::ServerState;

// =============================================================================
// Master/slave topology
// =============================================================================

#[tokio::test]
async fn test_clean_bootstrap_three_mariadb_servers() {
    let sim = ClusterBuilder::new("bootstrap-ms")
        .mariadb_servers(3)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();

    // No preferred master declared: index 0 wins.
    assert_eq!(sim.master_index().await, Some(0));

    for idx in [1usize, 2] {
        let handle = sim.handle(idx);
        assert_eq!(
            handle.channel_source(""),
            Some(("127.0.0.1".to_string(), 3306))
        );
        assert_eq!(handle.channel_mode(""), Some(MasterUseGtid::SlavePos));
        assert!(handle.is_read_only());
    }
    assert!(!sim.handle(0).is_read_only());

    // After a monitoring tick the roles settle.
    sim.tick(1).await;
    assert_eq!(sim.state_of(0).await, ServerState::Master);
    assert_eq!(sim.state_of(1).await, ServerState::Slave);
    assert_eq!(sim.state_of(2).await, ServerState::Slave);
}

#[tokio::test]
async fn test_bootstrap_is_idempotent_under_cleanup() {
    let sim = ClusterBuilder::new("bootstrap-idem")
        .mariadb_servers(3)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();
    let first = sim.cluster.pointers().await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();
    let second = sim.cluster.pointers().await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_bootstrap_rejects_wired_environment() {
    let sim = ClusterBuilder::new("bootstrap-wired")
        .mariadb_servers(2)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();
    let err = bootstrap::bootstrap_replication(&sim.cluster, false)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("already has an existing master/slave"));
}

// =============================================================================
// Multi-tier topology
// =============================================================================

#[tokio::test]
async fn test_multi_tier_with_four_servers() {
    let sim = ClusterBuilder::new("bootstrap-tier")
        .mariadb_servers(4)
        .configure(|conf| conf.topology.multi_tier_slave = true)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();

    assert_eq!(sim.master_index().await, Some(0));

    // Server 1 relays from the master with CURRENT_POS.
    let relay = sim.handle(1);
    assert_eq!(
        relay.channel_source(""),
        Some(("127.0.0.1".to_string(), 3306))
    );
    assert_eq!(relay.channel_mode(""), Some(MasterUseGtid::CurrentPos));

    // Leaves replicate from the relay.
    for idx in [2usize, 3] {
        let leaf = sim.handle(idx);
        assert_eq!(
            leaf.channel_source(""),
            Some(("127.0.0.1".to_string(), 3307))
        );
        assert_eq!(leaf.channel_mode(""), Some(MasterUseGtid::CurrentPos));
        assert!(leaf.is_read_only());
    }
    assert!(relay.is_read_only());

    sim.tick(1).await;
    assert!(sim.cluster.servers[1].read().await.is_relay);
    assert_eq!(sim.state_of(1).await, ServerState::Relay);
}

// =============================================================================
// Ring topology
// =============================================================================

#[tokio::test]
async fn test_ring_of_three() {
    let sim = ClusterBuilder::new("bootstrap-ring")
        .mariadb_servers(3)
        .configure(|conf| conf.topology.multi_master_ring = true)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();

    // Server i replicates from server (i - 1) mod 3.
    for (idx, source_port) in [(0usize, 3308u16), (1, 3306), (2, 3307)] {
        assert_eq!(
            sim.handle(idx).channel_source(""),
            Some(("127.0.0.1".to_string(), source_port)),
            "server {} has wrong source",
            idx
        );
    }
    assert_eq!(sim.cluster.vmaster_index().await, Some(0));
    assert_eq!(
        sim.cluster.conf.topology_kind().to_string(),
        "multi-master-ring"
    );
}

// =============================================================================
// Two-node active-active
// =============================================================================

#[tokio::test]
async fn test_two_node_multi_master() {
    let sim = ClusterBuilder::new("bootstrap-2node")
        .mariadb_servers(2)
        .configure(|conf| conf.topology.multi_master = true)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();

    assert_eq!(
        sim.handle(0).channel_source(""),
        Some(("127.0.0.1".to_string(), 3307))
    );
    assert_eq!(
        sim.handle(1).channel_source(""),
        Some(("127.0.0.1".to_string(), 3306))
    );
    // Conservative default: both nodes end read-only until an operator or
    // a failover opens one side.
    assert!(sim.handle(0).is_read_only());
    assert!(sim.handle(1).is_read_only());
    assert!(sim.master_index().await.is_some());
}

// =============================================================================
// Provision / unprovision lifecycle
// =============================================================================

#[tokio::test]
async fn test_full_bootstrap_then_unprovision_clears_everything() {
    let sim = ClusterBuilder::new("bootstrap-cycle")
        .mariadb_servers(3)
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap(&sim.cluster).await.unwrap();
    assert!(sim.cluster.sme.is_discovered());
    for server in &sim.cluster.servers {
        assert!(server.read().await.has_provision_cookie());
    }

    provision::unprovision_all(&sim.cluster).await.unwrap();

    assert!(!sim.cluster.sme.is_discovered());
    assert!(sim.master_index().await.is_none());
    for server in &sim.cluster.servers {
        let server = server.read().await;
        for cookie in Cookie::ALL {
            assert!(
                !cookies::has(&server.datadir, cookie),
                "cookie {:?} survived unprovision",
                cookie
            );
        }
    }
}

#[tokio::test]
async fn test_preferred_master_bootstrap() {
    let sim = ClusterBuilder::new("bootstrap-pref")
        .mariadb_servers(3)
        .configure(|conf| conf.topology.pref_master = Some("127.0.0.1:3308".to_string()))
        .build()
        .await;
    sim.tick(2).await;

    bootstrap::bootstrap_replication(&sim.cluster, true)
        .await
        .unwrap();
    assert_eq!(sim.master_index().await, Some(2));
}

//! Integration tests for UDP peer discovery
//!
//! Two discovery loops on loopback announce to each other's port.

mod common;

use common::*;
use multipc_sync::adapters::outbound::MemorySyncStore;
use multipc_sync::replication::discovery::{Announcement, DiscoveryConfig, DiscoveryService};
use multipc_sync::replication::{NodeId, NodeRole, NotificationHub, PeerRegistry, PeerStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// Reserve a free loopback UDP port.
fn free_port() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

fn discovery_config(bind_addr: SocketAddr, target: SocketAddr) -> DiscoveryConfig {
    DiscoveryConfig {
        bind_addr,
        targets: vec![target],
        interval: Duration::from_millis(100),
        stale_after: Duration::from_millis(400),
        evict_after: Duration::from_millis(900),
    }
}

#[tokio::test]
#[traced_test]
async fn test_two_nodes_discover_each_other() {
    let addr_a = free_port();
    let addr_b = free_port();

    let registry_a = PeerRegistry::new();
    let registry_b = PeerRegistry::new();
    let hub = NotificationHub::new();

    let node_a = DiscoveryService::new(
        discovery_config(addr_a, addr_b),
        Announcement::new(&NodeId::new("master-a"), NodeRole::Master, "caixa 1", 4000),
        registry_a.clone(),
        hub.clone(),
    )
    .start()
    .await
    .unwrap();
    let node_b = DiscoveryService::new(
        discovery_config(addr_b, addr_a),
        Announcement::new(&NodeId::new("sat-b"), NodeRole::Satellite, "caixa 2", 4001),
        registry_b.clone(),
        hub,
    )
    .start()
    .await
    .unwrap();
    assert_eq!(node_a.local_addr(), addr_a);

    node_a.refresh();
    node_b.refresh();
    eventually("b sees a", || registry_b.get("master-a").is_some()).await;
    eventually("a sees b", || registry_a.get("sat-b").is_some()).await;

    let master = registry_b.get("master-a").unwrap();
    assert_eq!(master.role, Some(NodeRole::Master));
    assert_eq!(master.display_name.as_deref(), Some("caixa 1"));
    // Sync address is the sender's ip with the announced sync port.
    assert_eq!(master.address, "127.0.0.1:4000".parse().unwrap());
    assert_eq!(master.status, PeerStatus::Discovered);
    assert!(!master.manual);
    assert_eq!(registry_b.master_candidate().unwrap().id, "master-a");

    // Nodes never list themselves.
    assert!(registry_a.get("master-a").is_none());
    assert!(registry_b.get("sat-b").is_none());

    // Once a node goes quiet it turns Stale and is then evicted.
    node_a.stop().await;
    eventually("a goes stale", || {
        registry_b
            .get("master-a")
            .map_or(true, |p| p.status == PeerStatus::Stale)
    })
    .await;
    assert!(registry_b.master_candidate().is_none());
    eventually("a is evicted", || registry_b.get("master-a").is_none()).await;

    node_b.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_satellite_finds_master_through_discovery() {
    let disc_master = free_port();
    let disc_sat = free_port();

    let master_store = Arc::new(MemorySyncStore::with_records([stock("sku-1", 8.0, 3)]));
    let master = new_manager(LICENSE, master_store);
    init_crypto();
    let config = fast_config(NodeRole::Master, "caixa 1")
        .discovery(disc_master, vec![disc_sat])
        .discovery_interval(Duration::from_millis(100));
    master.start(config).await.unwrap();
    let sync_addr = master.status().local_addr.unwrap();

    let sat_store = Arc::new(MemorySyncStore::new());
    let satellite = new_manager(LICENSE, sat_store.clone());
    let config = fast_config(NodeRole::Satellite, "caixa 2")
        .discovery(disc_sat, vec![disc_master])
        .discovery_interval(Duration::from_millis(100));
    satellite.start(config).await.unwrap();
    satellite.refresh_discovery().await.unwrap();

    wait_connected(&satellite).await;
    wait_for_version(&sat_store, &multipc_sync::EntityKey::stock("sku-1"), 3).await;

    let peer = satellite
        .list_peers()
        .into_iter()
        .find(|p| p.id == master.node_id().as_str())
        .unwrap();
    assert_eq!(peer.address, sync_addr);
    assert_eq!(peer.status, PeerStatus::Connected);

    // The master learns about the satellite from its announcements too.
    eventually("master lists satellite", || {
        master
            .list_peers()
            .iter()
            .any(|p| p.id == satellite.node_id().as_str())
    })
    .await;

    satellite.stop().await.unwrap();
    master.stop().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_discovery_bind_failure_keeps_role_running() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let taken_addr = taken.local_addr().unwrap();

    init_crypto();
    let manager = new_manager(LICENSE, Arc::new(MemorySyncStore::new()));
    let (_, mut errors) = manager
        .hub()
        .subscribe_channel(multipc_sync::replication::NotificationKind::Error);
    let config = fast_config(NodeRole::Master, "caixa 1").discovery(taken_addr, vec![taken_addr]);

    manager.start(config).await.unwrap();
    assert!(manager.is_running());
    assert!(errors.try_recv().is_ok());
    // Refreshing without a discovery loop is a no-op.
    manager.refresh_discovery().await.unwrap();

    manager.stop().await.unwrap();
}

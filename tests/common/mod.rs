//! Shared helpers for the integration tests.

#![allow(dead_code)]

use multipc_sync::adapters::outbound::{MemoryConfigRepository, MemorySyncStore};
use multipc_sync::domain::entities::{EntityKey, EntityRecord, EntityValue};
use multipc_sync::replication::{
    ConnectionManager, NetworkModeConfig, NodeId, NodeIdentity, NodeRole, NotificationHub,
    ReconnectPolicy,
};
use multipc_sync::SyncStore;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

pub const LICENSE: &str = "LIC-0001-TEST";

static INIT: Once = Once::new();

/// Initialize rustls CryptoProvider for tests
pub fn init_crypto() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Config with short timers and discovery off.
pub fn fast_config(role: NodeRole, name: &str) -> NetworkModeConfig {
    let mut config = NetworkModeConfig::new(role)
        .display_name(name)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .without_discovery()
        .heartbeat(Duration::from_millis(200), Duration::from_secs(2))
        .handshake_timeout(Duration::from_secs(2))
        .snapshot_timeout(Duration::from_secs(3))
        .proposal_timeout(Duration::from_secs(3))
        .reconnect(ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_millis(400),
            jitter_ratio: 0.2,
        });
    config.drain_timeout = Duration::from_secs(1);
    config
}

pub fn stock(id: &str, quantity: f64, version: u64) -> EntityRecord {
    EntityRecord {
        key: EntityKey::stock(id),
        value: Some(EntityValue::new(quantity)),
        version,
    }
}

pub fn new_manager(license: &str, store: Arc<MemorySyncStore>) -> ConnectionManager {
    let identity = NodeIdentity::new(NodeId::generate(), license.as_bytes());
    ConnectionManager::new(
        identity,
        store,
        Arc::new(MemoryConfigRepository::new()),
        NotificationHub::new(),
    )
}

/// Start a master on an ephemeral loopback port.
pub async fn start_master(store: Arc<MemorySyncStore>) -> (ConnectionManager, SocketAddr) {
    init_crypto();
    let manager = new_manager(LICENSE, store);
    manager
        .start(fast_config(NodeRole::Master, "master"))
        .await
        .expect("master starts");
    let addr = manager.status().local_addr.expect("master is bound");
    (manager, addr)
}

/// Start `manager` as a master bound to `addr` again, retrying while the
/// old socket is released.
pub async fn restart_master_on(manager: &ConnectionManager, addr: SocketAddr) {
    let mut config = fast_config(NodeRole::Master, "master");
    config.bind_addr = Some(addr);
    for _ in 0..20 {
        if manager.start(config.clone()).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("master could not rebind {}", addr);
}

pub fn satellite_config(name: &str, master: SocketAddr) -> NetworkModeConfig {
    fast_config(NodeRole::Satellite, name).target_addr(master)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_connected(manager: &ConnectionManager) {
    eventually("satellite link", || {
        manager.status().master_link.as_deref() == Some("connected")
    })
    .await;
}

/// Wait until the satellite store holds `key` at `version`.
pub async fn wait_for_version(store: &MemorySyncStore, key: &EntityKey, version: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = store.get(key).await.unwrap().map(|r| r.version).unwrap_or(0);
        if current >= version {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("{} stuck at version {}, expected {}", key, current, version);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

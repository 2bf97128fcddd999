//! Peer Discovery
//!
//! Finds other terminals on the LAN with UDP presence announcements. Every
//! interval this node announces itself to the configured targets (the LAN
//! broadcast address by default) and sweeps the registry for peers that
//! went quiet. Discovery only feeds the registry; it never opens a sync
//! connection.
//!
//! Uses Sans-IO pattern: announcement encoding and processing are pure
//! functions over the registry.

use crate::replication::codec::PROTOCOL_VERSION;
use crate::replication::events::{Notification, NotificationHub};
use crate::replication::registry::PeerRegistry;
use crate::replication::types::{now_ms, NodeId, NodeRole};
use crate::infrastructure::shutdown::ShutdownController;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Marks datagrams that belong to this protocol ("MPCS").
const ANNOUNCE_MAGIC: u32 = 0x4d50_4353;

/// Presence announcement broadcast by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub magic: u32,
    pub protocol_version: u16,
    pub node_id: String,
    pub role: NodeRole,
    pub display_name: String,
    /// Port of the node's sync endpoint
    pub sync_port: u16,
}

impl Announcement {
    pub fn new(node_id: &NodeId, role: NodeRole, display_name: &str, sync_port: u16) -> Self {
        Self {
            magic: ANNOUNCE_MAGIC,
            protocol_version: PROTOCOL_VERSION,
            node_id: node_id.0.clone(),
            role,
            display_name: display_name.to_string(),
            sync_port,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AnnouncementFrame {
    body: Vec<u8>,
    checksum: u32,
}

/// Encode an announcement datagram (Sans-IO pattern).
pub fn encode_announcement(announcement: &Announcement) -> anyhow::Result<Vec<u8>> {
    let body = bincode::serialize(announcement)?;
    let frame = AnnouncementFrame {
        checksum: crc32fast::hash(&body),
        body,
    };
    Ok(bincode::serialize(&frame)?)
}

/// Decode an announcement datagram, `None` for foreign or corrupt data.
pub fn decode_announcement(data: &[u8]) -> Option<Announcement> {
    let frame: AnnouncementFrame = bincode::deserialize(data).ok()?;
    if crc32fast::hash(&frame.body) != frame.checksum {
        return None;
    }
    let announcement: Announcement = bincode::deserialize(&frame.body).ok()?;
    (announcement.magic == ANNOUNCE_MAGIC && announcement.protocol_version == PROTOCOL_VERSION)
        .then_some(announcement)
}

/// Apply an announcement received from `src` to the registry.
///
/// Returns `true` when a new peer was discovered.
pub fn process_announcement(
    announcement: &Announcement,
    src: SocketAddr,
    local_node_id: &str,
    registry: &PeerRegistry,
    now_ms: u64,
) -> bool {
    if announcement.node_id == local_node_id {
        return false;
    }
    let sync_addr = SocketAddr::new(src.ip(), announcement.sync_port);
    registry.upsert_discovered(
        &announcement.node_id,
        sync_addr,
        announcement.role,
        &announcement.display_name,
        now_ms,
    )
}

/// Settings for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bind_addr: SocketAddr,
    pub targets: Vec<SocketAddr>,
    pub interval: Duration,
    pub stale_after: Duration,
    pub evict_after: Duration,
}

/// Discovery service for one role run.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    announcement: Announcement,
    registry: Arc<PeerRegistry>,
    hub: Arc<NotificationHub>,
}

impl DiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        announcement: Announcement,
        registry: Arc<PeerRegistry>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            config,
            announcement,
            registry,
            hub,
        }
    }

    /// Bind the UDP socket and spawn the announce/listen loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(self) -> anyhow::Result<DiscoveryHandle> {
        let socket = UdpSocket::bind(self.config.bind_addr).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        tracing::info!("discovery listening on {}", local_addr);

        let refresh = Arc::new(Notify::new());
        let shutdown = ShutdownController::new();
        let task = tokio::spawn(self.run(socket, refresh.clone(), shutdown.clone()));

        Ok(DiscoveryHandle {
            refresh,
            shutdown,
            task,
            local_addr,
        })
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(self, socket: UdpSocket, refresh: Arc<Notify>, shutdown: ShutdownController) {
        let datagram = match encode_announcement(&self.announcement) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("failed to encode announcement: {:?}", e);
                return;
            }
        };

        let mut buf = vec![0u8; 2048];
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("discovery shutting down");
                    break;
                }

                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                        Err(e) => tracing::debug!("discovery recv error: {:?}", e),
                    }
                }

                _ = ticker.tick() => self.cycle(&socket, &datagram).await,

                _ = refresh.notified() => {
                    tracing::debug!("discovery refresh requested");
                    self.cycle(&socket, &datagram).await;
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let Some(announcement) = decode_announcement(data) else {
            return;
        };
        if process_announcement(
            &announcement,
            src,
            &self.announcement.node_id,
            &self.registry,
            now_ms(),
        ) {
            tracing::info!(
                "discovered {} {} ({}) at {}",
                announcement.role,
                announcement.node_id,
                announcement.display_name,
                src.ip()
            );
        }
    }

    async fn cycle(&self, socket: &UdpSocket, datagram: &[u8]) {
        for target in &self.config.targets {
            if let Err(e) = socket.send_to(datagram, target).await {
                tracing::debug!("announce to {} failed: {:?}", target, e);
            }
        }

        let result = self
            .registry
            .sweep(now_ms(), self.config.stale_after, self.config.evict_after);
        for id in &result.marked_stale {
            tracing::info!("peer {} is stale", id);
        }
        for id in &result.evicted {
            tracing::info!("peer {} evicted", id);
        }
    }

    /// Start discovery, reporting a bind failure as a notification.
    ///
    /// Discovery is optional: the role keeps running without it.
    pub async fn start_or_report(self) -> Option<DiscoveryHandle> {
        let hub = self.hub.clone();
        let bind_addr = self.config.bind_addr;
        match self.start().await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("discovery disabled, bind {} failed: {:?}", bind_addr, e);
                hub.emit(Notification::error(format!(
                    "peer discovery unavailable: {}",
                    e
                )));
                None
            }
        }
    }
}

/// Handle to a running discovery loop.
pub struct DiscoveryHandle {
    refresh: Arc<Notify>,
    shutdown: ShutdownController,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl DiscoveryHandle {
    /// Run an announce and sweep cycle now.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!("discovery task failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::PeerStatus;

    fn announcement(id: &str, role: NodeRole) -> Announcement {
        Announcement::new(&NodeId::new(id), role, "loja", 3847)
    }

    #[test]
    fn test_announcement_roundtrip() {
        let ann = announcement("m1", NodeRole::Master);
        let data = encode_announcement(&ann).unwrap();
        assert_eq!(decode_announcement(&data), Some(ann));
    }

    #[test]
    fn test_corrupt_datagram_ignored() {
        let mut data = encode_announcement(&announcement("m1", NodeRole::Master)).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert_eq!(decode_announcement(&data), None);
        assert_eq!(decode_announcement(b"hello"), None);
    }

    #[test]
    fn test_foreign_magic_ignored() {
        let mut ann = announcement("m1", NodeRole::Master);
        ann.magic = 1;
        let data = encode_announcement(&ann).unwrap();
        assert_eq!(decode_announcement(&data), None);
    }

    #[test]
    fn test_process_uses_source_ip_and_sync_port() {
        let registry = PeerRegistry::new();
        let src: SocketAddr = "192.168.1.20:3848".parse().unwrap();

        let is_new = process_announcement(&announcement("m1", NodeRole::Master), src, "me", &registry, 5);
        assert!(is_new);

        let peer = registry.get("m1").unwrap();
        assert_eq!(peer.address, "192.168.1.20:3847".parse().unwrap());
        assert_eq!(peer.status, PeerStatus::Discovered);
        assert_eq!(peer.role, Some(NodeRole::Master));
    }

    #[test]
    fn test_own_announcement_ignored() {
        let registry = PeerRegistry::new();
        let src: SocketAddr = "127.0.0.1:3848".parse().unwrap();
        assert!(!process_announcement(&announcement("me", NodeRole::Master), src, "me", &registry, 5));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let hub = NotificationHub::new();
        let (_, mut errors) = hub.subscribe_channel(crate::replication::events::NotificationKind::Error);

        let service = DiscoveryService::new(
            DiscoveryConfig {
                bind_addr: addr,
                targets: vec![addr],
                interval: Duration::from_millis(50),
                stale_after: Duration::from_secs(1),
                evict_after: Duration::from_secs(2),
            },
            announcement("me", NodeRole::Satellite),
            PeerRegistry::new(),
            hub,
        );

        assert!(service.start_or_report().await.is_none());
        assert!(matches!(errors.recv().await, Some(Notification::Error { .. })));
    }
}

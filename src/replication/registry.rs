//! Peer Registry
//!
//! In-memory table of peers known to this node. Created fresh for every
//! `start()` and shared by `Arc` with discovery and the active role
//! handler; nothing survives a role restart.

use crate::replication::types::{NodeRole, PeerInfo, PeerStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Key used for a manual entry until its node id is known.
pub fn manual_peer_id(address: SocketAddr) -> String {
    address.to_string()
}

/// Result of a staleness sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepResult {
    pub marked_stale: Vec<String>,
    pub evicted: Vec<String>,
}

/// Registry of known peers.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerInfo>>,
    changed: Notify,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Wait for the next change to the registry.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Record an announcement seen by discovery.
    ///
    /// Returns `true` when the peer was not known before.
    pub fn upsert_discovered(
        &self,
        id: &str,
        address: SocketAddr,
        role: NodeRole,
        display_name: &str,
        now_ms: u64,
    ) -> bool {
        let is_new = {
            let mut peers = self.peers.write();

            // A manual entry for the same address is the same peer.
            let manual_key = manual_peer_id(address);
            if manual_key != id {
                if let Some(mut manual) = peers.remove(&manual_key) {
                    manual.id = id.to_string();
                    peers.insert(id.to_string(), manual);
                }
            }

            match peers.get_mut(id) {
                Some(peer) => {
                    peer.address = address;
                    peer.role = Some(role);
                    peer.display_name = Some(display_name.to_string());
                    peer.last_seen_ms = now_ms;
                    if peer.status == PeerStatus::Stale {
                        peer.status = PeerStatus::Discovered;
                    }
                    false
                }
                None => {
                    peers.insert(
                        id.to_string(),
                        PeerInfo {
                            id: id.to_string(),
                            address,
                            role: Some(role),
                            display_name: Some(display_name.to_string()),
                            last_seen_ms: now_ms,
                            status: PeerStatus::Discovered,
                            manual: false,
                        },
                    );
                    true
                }
            }
        };

        self.notify();
        is_new
    }

    /// Add a peer by hand. Clears any earlier rejection.
    pub fn add_manual(
        &self,
        address: SocketAddr,
        display_name: Option<String>,
        role: Option<NodeRole>,
        now_ms: u64,
    ) -> PeerInfo {
        let peer = {
            let mut peers = self.peers.write();
            let existing = peers
                .values_mut()
                .find(|p| p.address == address);

            match existing {
                Some(peer) => {
                    peer.manual = true;
                    peer.status = PeerStatus::Discovered;
                    peer.last_seen_ms = now_ms;
                    if display_name.is_some() {
                        peer.display_name = display_name;
                    }
                    if role.is_some() {
                        peer.role = role;
                    }
                    peer.clone()
                }
                None => {
                    let peer = PeerInfo {
                        id: manual_peer_id(address),
                        address,
                        role,
                        display_name,
                        last_seen_ms: now_ms,
                        status: PeerStatus::Discovered,
                        manual: true,
                    };
                    peers.insert(peer.id.clone(), peer.clone());
                    peer
                }
            }
        };

        self.notify();
        peer
    }

    pub fn remove(&self, id: &str) -> Option<PeerInfo> {
        let removed = self.peers.write().remove(id);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.read().get(id).cloned()
    }

    pub fn find_by_address(&self, address: SocketAddr) -> Option<PeerInfo> {
        self.peers
            .read()
            .values()
            .find(|p| p.address == address)
            .cloned()
    }

    /// All peers, sorted by id.
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_online()).count()
    }

    /// Total and connected peer counts, read under one lock.
    pub fn counts(&self) -> (usize, usize) {
        let peers = self.peers.read();
        let online = peers.values().filter(|p| p.is_online()).count();
        (peers.len(), online)
    }

    /// Update the status of a peer by id. Returns `false` if unknown.
    pub fn set_status(&self, id: &str, status: PeerStatus) -> bool {
        let updated = match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.status = status;
                true
            }
            None => false,
        };
        if updated {
            self.notify();
        }
        updated
    }

    /// Record a successful handshake with a peer.
    ///
    /// Re-keys a manual `ip:port` entry to the peer's node id. `address`
    /// is the peer's sync endpoint when known (outbound links); inbound
    /// links pass `None` since the remote port is ephemeral.
    pub fn record_handshake(
        &self,
        node_id: &str,
        address: SocketAddr,
        sync_address_known: bool,
        role: NodeRole,
        display_name: &str,
        now_ms: u64,
    ) {
        {
            let mut peers = self.peers.write();

            if sync_address_known {
                let manual_key = manual_peer_id(address);
                if manual_key != node_id {
                    if let Some(mut manual) = peers.remove(&manual_key) {
                        manual.id = node_id.to_string();
                        peers.insert(node_id.to_string(), manual);
                    }
                }
            }

            let peer = peers.entry(node_id.to_string()).or_insert_with(|| PeerInfo {
                id: node_id.to_string(),
                address,
                role: Some(role),
                display_name: Some(display_name.to_string()),
                last_seen_ms: now_ms,
                status: PeerStatus::Connected,
                manual: false,
            });
            if sync_address_known {
                peer.address = address;
            }
            peer.role = Some(role);
            peer.display_name = Some(display_name.to_string());
            peer.last_seen_ms = now_ms;
            peer.status = PeerStatus::Connected;
        }
        self.notify();
    }

    /// Refresh `last_seen` after any successful exchange.
    pub fn touch(&self, id: &str, now_ms: u64) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.last_seen_ms = now_ms;
        }
    }

    /// Mark a peer Stale. Rejected peers stay Rejected.
    pub fn mark_stale(&self, id: &str) -> bool {
        let updated = match self.peers.write().get_mut(id) {
            Some(peer) if peer.status != PeerStatus::Rejected => {
                peer.status = PeerStatus::Stale;
                true
            }
            _ => false,
        };
        if updated {
            self.notify();
        }
        updated
    }

    /// Mark the peer at `address` as Rejected (failed authentication).
    pub fn mark_rejected(&self, id: Option<&str>, address: SocketAddr) {
        let updated = {
            let mut peers = self.peers.write();
            let key = match id.filter(|id| peers.contains_key(*id)) {
                Some(id) => Some(id.to_string()),
                None => peers
                    .values()
                    .find(|p| p.address == address)
                    .map(|p| p.id.clone()),
            };
            match key.and_then(|k| peers.get_mut(&k)) {
                Some(peer) => {
                    peer.status = PeerStatus::Rejected;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        }
    }

    /// Best master candidate: a usable peer that declared the Master role.
    pub fn master_candidate(&self) -> Option<PeerInfo> {
        self.peers
            .read()
            .values()
            .filter(|p| p.role == Some(NodeRole::Master) && p.status.is_usable())
            .max_by_key(|p| p.last_seen_ms)
            .cloned()
    }

    /// Whether the peer at `address` refused our credentials.
    pub fn is_rejected_address(&self, address: SocketAddr) -> bool {
        self.find_by_address(address)
            .is_some_and(|peer| peer.status == PeerStatus::Rejected)
    }

    /// Mark peers silent for `stale_after` as Stale and evict non-manual
    /// peers silent for `evict_after`.
    ///
    /// Connected peers are kept alive by their session and are skipped.
    pub fn sweep(&self, now_ms: u64, stale_after: Duration, evict_after: Duration) -> SweepResult {
        let stale_ms = stale_after.as_millis() as u64;
        let evict_ms = evict_after.as_millis() as u64;
        let mut result = SweepResult::default();

        {
            let mut peers = self.peers.write();
            peers.retain(|id, peer| {
                if peer.status == PeerStatus::Connected {
                    return true;
                }
                let silent = now_ms.saturating_sub(peer.last_seen_ms);
                if silent > evict_ms && !peer.manual {
                    result.evicted.push(id.clone());
                    return false;
                }
                if silent > stale_ms && peer.status == PeerStatus::Discovered {
                    peer.status = PeerStatus::Stale;
                    result.marked_stale.push(id.clone());
                }
                true
            });
        }

        if !result.marked_stale.is_empty() || !result.evicted.is_empty() {
            self.notify();
        }
        result
    }
}

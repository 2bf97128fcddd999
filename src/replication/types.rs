//! Replication Types
//!
//! Core types shared by the sync components: node identity, roles, peer
//! records and connection statistics.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Domain tag mixed into the shared secret derivation.
const SECRET_DOMAIN_TAG: &[u8] = b"multipc-sync/shared-secret/v1";

/// Milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique identifier for a node on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node plays on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// No networking; local operations commit directly
    Standalone,
    /// Holds authoritative state and assigns versions
    Master,
    /// Mirrors the master and routes writes through it
    Satellite,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Standalone => "standalone",
            NodeRole::Master => "master",
            NodeRole::Satellite => "satellite",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Ok(NodeRole::Standalone),
            "master" => Ok(NodeRole::Master),
            "satellite" => Ok(NodeRole::Satellite),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Identity of this application instance.
///
/// The node id is created once and persisted; the shared secret is derived
/// from the license material so that every terminal under the same license
/// computes the same key.
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    shared_secret: [u8; 32],
}

impl NodeIdentity {
    pub fn new(node_id: NodeId, license_material: &[u8]) -> Self {
        Self {
            node_id,
            shared_secret: derive_shared_secret(license_material),
        }
    }

    pub fn shared_secret(&self) -> &[u8] {
        &self.shared_secret
    }

    /// Load the node id from `path`, creating it on first run.
    pub fn load_or_create(path: &Path, license_material: &[u8]) -> anyhow::Result<Self> {
        #[derive(Serialize, Deserialize)]
        struct StoredIdentity {
            node_id: String,
        }

        let node_id = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let stored: StoredIdentity = serde_json::from_str(&raw)?;
            NodeId::new(stored.node_id)
        } else {
            let node_id = NodeId::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let stored = StoredIdentity {
                node_id: node_id.0.clone(),
            };
            std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
            tracing::info!("created node identity {}", node_id);
            node_id
        };

        Ok(Self::new(node_id, license_material))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

fn derive_shared_secret(license_material: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SECRET_DOMAIN_TAG);
    hasher.update(license_material);
    hasher.finalize().into()
}

/// Connection status of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Discovered,
    Connecting,
    Connected,
    Stale,
    Rejected,
}

impl PeerStatus {
    /// Whether the peer may be used for connect attempts and broadcasts.
    pub fn is_usable(&self) -> bool {
        !matches!(self, PeerStatus::Stale | PeerStatus::Rejected)
    }
}

/// A peer known to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node id, or `ip:port` for a manual entry not yet handshaken
    pub id: String,
    /// Sync endpoint address
    pub address: SocketAddr,
    pub role: Option<NodeRole>,
    pub display_name: Option<String>,
    pub last_seen_ms: u64,
    pub status: PeerStatus,
    /// Added by hand; never evicted
    pub manual: bool,
}

impl PeerInfo {
    pub fn is_online(&self) -> bool {
        self.status == PeerStatus::Connected
    }
}

/// Counters owned by the active role handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total_peers: usize,
    pub online_peers: usize,
    pub offline_peers: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_attempts: u64,
    /// Seconds since the last lifecycle state change
    pub uptime_secs: u64,
    pub last_sync_ms: Option<u64>,
    /// Errors in the last five minutes, newest last
    pub recent_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(id.as_str(), "node-1");
        assert_eq!(NodeId::from("node-1"), id);
    }

    #[test]
    fn test_generated_node_ids_differ() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Master".parse::<NodeRole>(), Ok(NodeRole::Master));
        assert_eq!("satellite".parse::<NodeRole>(), Ok(NodeRole::Satellite));
        assert!("hybrid".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::Standalone.to_string(), "standalone");
    }

    #[test]
    fn test_shared_secret_depends_on_license() {
        let a = NodeIdentity::new(NodeId::new("a"), b"license-1");
        let b = NodeIdentity::new(NodeId::new("b"), b"license-1");
        let c = NodeIdentity::new(NodeId::new("c"), b"license-2");

        assert_eq!(a.shared_secret(), b.shared_secret());
        assert_ne!(a.shared_secret(), c.shared_secret());
        assert_eq!(a.shared_secret().len(), 32);
    }

    #[test]
    fn test_identity_debug_redacts_secret() {
        let identity = NodeIdentity::new(NodeId::new("a"), b"license");
        let debug = format!("{:?}", identity);
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = NodeIdentity::load_or_create(&path, b"license").unwrap();
        let second = NodeIdentity::load_or_create(&path, b"license").unwrap();

        assert_eq!(first.node_id, second.node_id);
        assert!(path.exists());
    }

    #[test]
    fn test_peer_status_usable() {
        assert!(PeerStatus::Discovered.is_usable());
        assert!(PeerStatus::Connected.is_usable());
        assert!(!PeerStatus::Stale.is_usable());
        assert!(!PeerStatus::Rejected.is_usable());
    }
}

//! Multi-Terminal Sync
//!
//! Keeps the stock of several point-of-sale terminals on one LAN in sync.
//! One terminal runs as Master and owns the authoritative state; the
//! others run as Satellites and mirror it.
//!
//! ## Architecture
//!
//! - **Discovery (UDP)**: presence announcements fill the peer registry
//! - **Transport (QUIC)**: one authenticated bidirectional stream per link
//! - **Protocol**: HMAC handshake, snapshot exchange, ordered per-entity deltas
//! - **Authority**: single writer that validates and versions every mutation
//! - **Manager**: lifecycle and control plane over the active role
//!
//! ## How It Works
//!
//! 1. Nodes announce themselves on the discovery port (3848 by default)
//! 2. A satellite connects to its master's sync port (3847) and handshakes
//! 3. The master sends a snapshot, then every committed delta in order
//! 4. Local mutations on a satellite go to the master as proposals
//!
//! ## Usage
//!
//! ```rust,ignore
//! use multipc_sync::replication::{ConnectionManager, NetworkModeConfig, NotificationHub};
//!
//! let manager = ConnectionManager::new(identity, store, config_repo, NotificationHub::new());
//! manager.start(NetworkModeConfig::satellite(Some("192.168.0.10:3847".parse()?))).await?;
//! manager.adjust_stock("sku-1", -1.0).await?;
//! ```

pub mod authority;
pub mod codec;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod events;
pub mod manager;
pub mod master;
pub mod protocol;
pub mod registry;
pub mod satellite;
pub mod stats;
pub mod transport;
pub mod types;

pub use authority::{Authority, CommitReceipt};
pub use config::{NetworkModeConfig, ReconnectPolicy};
pub use error::{
    AuthError, ManagerError, ProposalError, ProtocolError, StartError, StopError, SyncError,
    TransportError, ValidationError,
};
pub use events::{ListenerId, Notification, NotificationHub, NotificationKind};
pub use manager::{ConnectionManager, LifecycleState, MultiPcNetworkStatus};
pub use registry::PeerRegistry;
pub use master::SessionInfo;
pub use satellite::ProbeResult;
pub use types::{ConnectionStats, NodeId, NodeIdentity, NodeRole, PeerInfo, PeerStatus};

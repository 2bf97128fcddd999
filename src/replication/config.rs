//! Network Mode Configuration
//!
//! Configuration for the sync core: which role this node plays, where it
//! listens or connects, and the timing of discovery, liveness and
//! reconnection.

use crate::replication::types::NodeRole;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default sync port (QUIC).
pub const DEFAULT_SYNC_PORT: u16 = 3847;

/// Default discovery port (UDP).
pub const DEFAULT_DISCOVERY_PORT: u16 = 3848;

/// Reconnect backoff parameters for the satellite link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry (default: 5s)
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,
    /// Upper bound on any delay (default: 60s)
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Random jitter as a fraction of the un-jittered delay (default: 0.2)
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::InvalidReconnectPolicy(
                "base_delay must be positive".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::InvalidReconnectPolicy(
                "max_delay must be at least base_delay".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidReconnectPolicy(
                "multiplier must be >= 1.0".to_string(),
            ));
        }
        // Jitter above the growth step could make a later delay shorter
        // than an earlier one.
        if !self.jitter_ratio.is_finite()
            || self.jitter_ratio < 0.0
            || self.jitter_ratio > self.multiplier - 1.0
        {
            return Err(ConfigError::InvalidReconnectPolicy(
                "jitter_ratio must be within [0, multiplier - 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration owned by the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkModeConfig {
    /// Role to run (default: Standalone)
    pub role: NodeRole,

    /// Address the master listens on (default: 0.0.0.0:3847)
    pub bind_addr: Option<SocketAddr>,

    /// Master to connect to as a satellite; discovered when unset
    pub target_addr: Option<SocketAddr>,

    /// Name shown to other terminals
    pub display_name: String,

    /// Enable UDP presence announcements (default: true)
    pub discovery_enabled: bool,

    /// Address the discovery socket binds (default: 0.0.0.0:3848)
    pub discovery_addr: SocketAddr,

    /// Where announcements are sent (default: LAN broadcast)
    pub announce_targets: Vec<SocketAddr>,

    /// Announce and sweep interval (default: 5s)
    #[serde(with = "duration_ms")]
    pub discovery_interval: Duration,

    /// Peers not seen for this long become Stale (default: 30s)
    #[serde(with = "duration_ms")]
    pub peer_stale_after: Duration,

    /// Non-manual peers not seen for this long are evicted (default: 300s)
    #[serde(with = "duration_ms")]
    pub peer_evict_after: Duration,

    /// Heartbeat send interval (default: 15s)
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Silence after which a link is considered dead (default: 45s)
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Time allowed for the handshake (default: 10s)
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Time allowed for a snapshot to arrive after requesting it (default: 30s)
    #[serde(with = "duration_ms")]
    pub snapshot_timeout: Duration,

    /// Time a satellite waits for a proposal outcome (default: 10s)
    #[serde(with = "duration_ms")]
    pub proposal_timeout: Duration,

    /// Time `stop()` waits for sessions to drain (default: 5s)
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,

    pub reconnect: ReconnectPolicy,
}

impl Default for NetworkModeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Standalone,
            bind_addr: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_SYNC_PORT))),
            target_addr: None,
            display_name: "terminal".to_string(),
            discovery_enabled: true,
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            announce_targets: vec![SocketAddr::from((
                [255, 255, 255, 255],
                DEFAULT_DISCOVERY_PORT,
            ))],
            discovery_interval: Duration::from_secs(5),
            peer_stale_after: Duration::from_secs(30),
            peer_evict_after: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            handshake_timeout: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(30),
            proposal_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl NetworkModeConfig {
    /// Create a configuration for the given role.
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    pub fn standalone() -> Self {
        Self::new(NodeRole::Standalone)
    }

    pub fn master(bind_addr: SocketAddr) -> Self {
        Self::new(NodeRole::Master).bind_addr(bind_addr)
    }

    pub fn satellite(target_addr: Option<SocketAddr>) -> Self {
        Self {
            target_addr,
            ..Self::new(NodeRole::Satellite)
        }
    }

    /// Set the master bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the satellite target.
    pub fn target_addr(mut self, addr: SocketAddr) -> Self {
        self.target_addr = Some(addr);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Disable discovery entirely.
    pub fn without_discovery(mut self) -> Self {
        self.discovery_enabled = false;
        self
    }

    /// Set the discovery bind address and announcement targets.
    pub fn discovery(mut self, addr: SocketAddr, targets: Vec<SocketAddr>) -> Self {
        self.discovery_enabled = true;
        self.discovery_addr = addr;
        self.announce_targets = targets;
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set the peer staleness and eviction thresholds.
    pub fn peer_timeouts(mut self, stale_after: Duration, evict_after: Duration) -> Self {
        self.peer_stale_after = stale_after;
        self.peer_evict_after = evict_after;
        self
    }

    /// Set heartbeat interval and liveness timeout.
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role == NodeRole::Master && self.bind_addr.is_none() {
            return Err(ConfigError::MissingBindAddr);
        }
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::MissingDisplayName);
        }
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("snapshot_timeout", self.snapshot_timeout),
            ("proposal_timeout", self.proposal_timeout),
            ("discovery_interval", self.discovery_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort);
        }
        if self.peer_evict_after <= self.peer_stale_after {
            return Err(ConfigError::EvictionBeforeStale);
        }
        if self.discovery_enabled && self.announce_targets.is_empty() {
            return Err(ConfigError::NoAnnounceTargets);
        }
        self.reconnect.validate()
    }

    /// Sync port advertised to other nodes.
    pub fn sync_port(&self) -> u16 {
        self.bind_addr.map(|a| a.port()).unwrap_or(DEFAULT_SYNC_PORT)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("master role requires a bind address")]
    MissingBindAddr,
    #[error("display_name is required")]
    MissingDisplayName,
    #[error("{0} must be positive")]
    ZeroDuration(&'static str),
    #[error("heartbeat_timeout must exceed heartbeat_interval")]
    HeartbeatTimeoutTooShort,
    #[error("peer_evict_after must exceed peer_stale_after")]
    EvictionBeforeStale,
    #[error("discovery is enabled but no announce targets are set")]
    NoAnnounceTargets,
    #[error("invalid reconnect policy: {0}")]
    InvalidReconnectPolicy(String),
}

/// Serialize durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkModeConfig::default();
        assert_eq!(config.role, NodeRole::Standalone);
        assert_eq!(config.sync_port(), DEFAULT_SYNC_PORT);
        assert_eq!(config.discovery_addr.port(), DEFAULT_DISCOVERY_PORT);
        assert!(config.discovery_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = NetworkModeConfig::master("127.0.0.1:5000".parse().unwrap())
            .display_name("caixa-1")
            .heartbeat(Duration::from_secs(1), Duration::from_secs(3))
            .without_discovery();

        assert_eq!(config.role, NodeRole::Master);
        assert_eq!(config.sync_port(), 5000);
        assert_eq!(config.display_name, "caixa-1");
        assert!(!config.discovery_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_master_without_bind() {
        let mut config = NetworkModeConfig::new(NodeRole::Master);
        config.bind_addr = None;
        assert_eq!(config.validate(), Err(ConfigError::MissingBindAddr));
    }

    #[test]
    fn test_satellite_without_target_is_valid() {
        let config = NetworkModeConfig::satellite(None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_heartbeat_timeout() {
        let config = NetworkModeConfig::default()
            .heartbeat(Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(config.validate(), Err(ConfigError::HeartbeatTimeoutTooShort));
    }

    #[test]
    fn test_validate_zero_duration() {
        let config = NetworkModeConfig::default().handshake_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("handshake_timeout"))
        );
    }

    #[test]
    fn test_validate_eviction_order() {
        let config = NetworkModeConfig::default()
            .peer_timeouts(Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(config.validate(), Err(ConfigError::EvictionBeforeStale));
    }

    #[test]
    fn test_validate_announce_targets() {
        let config = NetworkModeConfig::default().discovery("0.0.0.0:0".parse().unwrap(), vec![]);
        assert_eq!(config.validate(), Err(ConfigError::NoAnnounceTargets));
    }

    #[test]
    fn test_validate_jitter_bound() {
        let policy = ReconnectPolicy {
            multiplier: 1.5,
            jitter_ratio: 0.6,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidReconnectPolicy(_))
        ));

        let policy = ReconnectPolicy {
            multiplier: 1.5,
            jitter_ratio: 0.5,
            ..Default::default()
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_max_below_base() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let config = NetworkModeConfig::satellite(Some("10.0.0.5:3847".parse().unwrap()));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"heartbeat_interval\":15000"));

        let restored: NetworkModeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}

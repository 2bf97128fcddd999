//! Connection Manager
//!
//! Control plane of the sync core. Owns the lifecycle of the active role
//! (`Stopped -> Starting -> Running -> Stopping -> Stopped`) and exposes
//! the operations the application calls: start/stop, peer management,
//! master link control, configuration and local mutations.
//!
//! Lifecycle transitions are serialized through one async lock. The
//! observable status lives in a separate sync lock so `status()` never
//! waits behind a start or stop in progress.

use crate::domain::entities::{EntityKey, Mutation};
use crate::domain::ports::{ConfigRepository, SyncStore};
use crate::replication::authority::{Authority, CommitReceipt};
use crate::replication::config::{NetworkModeConfig, DEFAULT_SYNC_PORT};
use crate::replication::context::{FatalHook, RoleContext};
use crate::replication::discovery::{Announcement, DiscoveryConfig, DiscoveryHandle, DiscoveryService};
use crate::replication::error::{
    ManagerError, ProposalError, StartError, StopError, SyncError,
};
use crate::replication::events::{ListenerId, Notification, NotificationHub, NotificationKind};
use crate::replication::master::{MasterHandler, SessionInfo};
use crate::replication::registry::PeerRegistry;
use crate::replication::satellite::{
    self, ProbeResult, SatelliteClient, SatelliteHandler, SatelliteStatusHandle,
};
use crate::replication::stats::StatsTracker;
use crate::replication::types::{now_ms, ConnectionStats, NodeId, NodeIdentity, NodeRole, PeerInfo};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle of the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time status returned by `ConnectionManager::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiPcNetworkStatus {
    pub state: LifecycleState,
    pub role: NodeRole,
    pub node_id: NodeId,
    /// Master listening address
    pub local_addr: Option<SocketAddr>,
    /// Satellite link state name
    pub master_link: Option<String>,
    pub master_id: Option<String>,
    pub connected_peers: usize,
    pub last_error: Option<String>,
}

/// The role a running node plays.
enum ActiveRole {
    Standalone(Arc<Authority>),
    Master(MasterHandler),
    Satellite(SatelliteHandler),
}

impl ActiveRole {
    fn role(&self) -> NodeRole {
        match self {
            ActiveRole::Standalone(_) => NodeRole::Standalone,
            ActiveRole::Master(_) => NodeRole::Master,
            ActiveRole::Satellite(_) => NodeRole::Satellite,
        }
    }
}

/// Everything that lives for one `start()`.
struct Running {
    role: ActiveRole,
    discovery: Option<DiscoveryHandle>,
    generation: u64,
}

impl Running {
    async fn shutdown(self) -> Result<(), StopError> {
        if let Some(discovery) = self.discovery {
            discovery.stop().await;
        }
        match self.role {
            ActiveRole::Standalone(_) => Ok(()),
            ActiveRole::Master(handler) => handler.stop().await,
            ActiveRole::Satellite(handler) => handler.stop().await,
        }
    }

    fn satellite(&self) -> Result<SatelliteClient, ManagerError> {
        match &self.role {
            ActiveRole::Satellite(handler) => Ok(handler.client()),
            other => Err(ManagerError::RoleMismatch {
                expected: NodeRole::Satellite,
                actual: other.role(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct StatusCell {
    state: LifecycleState,
    role: NodeRole,
    local_addr: Option<SocketAddr>,
    last_error: Option<String>,
}

struct ManagerInner {
    identity: NodeIdentity,
    store: Arc<dyn SyncStore>,
    config_repo: Arc<dyn ConfigRepository>,
    hub: Arc<NotificationHub>,
    config: RwLock<NetworkModeConfig>,
    lifecycle: Mutex<Option<Running>>,
    status: RwLock<StatusCell>,
    registry: RwLock<Arc<PeerRegistry>>,
    stats: RwLock<Arc<StatsTracker>>,
    satellite_status: RwLock<Option<SatelliteStatusHandle>>,
    generation: AtomicU64,
}

impl ManagerInner {
    fn set_state(&self, state: LifecycleState) {
        self.status.write().state = state;
    }

    fn fatal_hook(self: &Arc<Self>, generation: u64) -> FatalHook {
        let weak = Arc::downgrade(self);
        Arc::new(move |err: SyncError| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move { inner.handle_fatal(generation, err).await });
            }
        })
    }

    /// Tear down the role that raised `err`, unless it was already replaced.
    async fn handle_fatal(self: Arc<Self>, generation: u64, err: SyncError) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.as_ref().map(|r| r.generation) != Some(generation) {
            return;
        }
        if let Some(running) = lifecycle.take() {
            if let Err(e) = running.shutdown().await {
                tracing::warn!("teardown after failure: {}", e);
            }
        }
        *self.satellite_status.write() = None;

        let message = format!("sync stopped: {}", err);
        {
            let mut status = self.status.write();
            status.state = LifecycleState::Stopped;
            status.local_addr = None;
            status.last_error = Some(message.clone());
        }
        self.stats.read().record_error(now_ms(), message.clone());
        self.hub.emit(Notification::error(message));
    }

    /// Build and start everything for one role run.
    async fn launch(self: &Arc<Self>, config: NetworkModeConfig) -> Result<Running, StartError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let registry = PeerRegistry::new();
        let stats = Arc::new(StatsTracker::new());
        *self.registry.write() = registry.clone();
        *self.stats.write() = stats.clone();

        let ctx = RoleContext {
            identity: self.identity.clone(),
            config: config.clone(),
            store: self.store.clone(),
            registry: registry.clone(),
            hub: self.hub.clone(),
            stats,
            on_fatal: self.fatal_hook(generation),
        };

        let (role, sync_port) = match config.role {
            NodeRole::Standalone => {
                let authority = Authority::new(self.store.clone(), self.hub.clone());
                (ActiveRole::Standalone(authority), None)
            }
            NodeRole::Master => {
                let authority = Authority::new(self.store.clone(), self.hub.clone());
                let handler = MasterHandler::start(ctx, authority)?;
                let port = handler.local_addr().port();
                self.status.write().local_addr = Some(handler.local_addr());
                (ActiveRole::Master(handler), Some(port))
            }
            NodeRole::Satellite => {
                let handler = SatelliteHandler::start(ctx)?;
                *self.satellite_status.write() = Some(handler.status_handle());
                (ActiveRole::Satellite(handler), Some(config.sync_port()))
            }
        };

        let discovery = match sync_port {
            Some(port) if config.discovery_enabled => {
                let announcement = Announcement::new(
                    &self.identity.node_id,
                    config.role,
                    &config.display_name,
                    port,
                );
                let discovery_config = DiscoveryConfig {
                    bind_addr: config.discovery_addr,
                    targets: config.announce_targets.clone(),
                    interval: config.discovery_interval,
                    stale_after: config.peer_stale_after,
                    evict_after: config.peer_evict_after,
                };
                DiscoveryService::new(discovery_config, announcement, registry, self.hub.clone())
                    .start_or_report()
                    .await
            }
            _ => None,
        };

        Ok(Running {
            role,
            discovery,
            generation,
        })
    }

    /// Stop the current run (if any) and start `config` in its place.
    async fn start_locked(
        self: &Arc<Self>,
        lifecycle: &mut Option<Running>,
        config: NetworkModeConfig,
    ) -> Result<(), StartError> {
        {
            let mut status = self.status.write();
            status.state = LifecycleState::Starting;
            status.role = config.role;
            status.local_addr = None;
            status.last_error = None;
        }
        *self.config.write() = config.clone();

        match self.launch(config).await {
            Ok(running) => {
                tracing::info!("sync running as {}", running.role.role());
                *lifecycle = Some(running);
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!("failed to start sync: {}", e);
                *self.satellite_status.write() = None;
                let mut status = self.status.write();
                status.state = LifecycleState::Stopped;
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, lifecycle: &mut Option<Running>) -> Result<(), StopError> {
        let Some(running) = lifecycle.take() else {
            return Ok(());
        };
        self.set_state(LifecycleState::Stopping);
        let result = running.shutdown().await;
        *self.satellite_status.write() = None;
        {
            let mut status = self.status.write();
            status.state = LifecycleState::Stopped;
            status.local_addr = None;
        }
        tracing::info!("sync stopped");
        result
    }
}

/// Entry point for the application.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        identity: NodeIdentity,
        store: Arc<dyn SyncStore>,
        config_repo: Arc<dyn ConfigRepository>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        let config = NetworkModeConfig::default();
        Self {
            inner: Arc::new(ManagerInner {
                identity,
                store,
                config_repo,
                hub,
                status: RwLock::new(StatusCell {
                    state: LifecycleState::Stopped,
                    role: config.role,
                    local_addr: None,
                    last_error: None,
                }),
                config: RwLock::new(config),
                lifecycle: Mutex::new(None),
                registry: RwLock::new(PeerRegistry::new()),
                stats: RwLock::new(Arc::new(StatsTracker::new())),
                satellite_status: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.identity.node_id
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.inner.hub
    }

    /// Load the persisted configuration, falling back to defaults.
    pub async fn load_config(&self) -> Result<NetworkModeConfig, ManagerError> {
        let config = self
            .inner
            .config_repo
            .load()
            .await
            .map_err(|e| ManagerError::Persist(format!("{:#}", e)))?
            .unwrap_or_default();
        *self.inner.config.write() = config.clone();
        Ok(config)
    }

    // ==================== Lifecycle ====================

    /// Start the role described by `config`.
    pub async fn start(&self, config: NetworkModeConfig) -> Result<(), StartError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        config.validate()?;
        self.inner.start_locked(&mut lifecycle, config).await
    }

    /// Stop the active role. Stopping a stopped manager is a no-op.
    pub async fn stop(&self) -> Result<(), StopError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(&mut lifecycle).await
    }

    pub fn status(&self) -> MultiPcNetworkStatus {
        let cell = self.inner.status.read().clone();
        let satellite = self.inner.satellite_status.read().as_ref().map(|s| s.get());

        MultiPcNetworkStatus {
            state: cell.state,
            role: cell.role,
            node_id: self.inner.identity.node_id.clone(),
            local_addr: cell.local_addr,
            master_link: satellite.as_ref().map(|s| s.link.name().to_string()),
            master_id: satellite.and_then(|s| s.master_id),
            connected_peers: self.inner.registry.read().connected_count(),
            last_error: cell.last_error,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.read().state == LifecycleState::Running
    }

    // ==================== Configuration ====================

    pub fn get_config(&self) -> NetworkModeConfig {
        self.inner.config.read().clone()
    }

    /// Validate and persist `config`, restarting the active role if it
    /// changed.
    pub async fn save_config(&self, config: NetworkModeConfig) -> Result<(), ManagerError> {
        config.validate()?;
        self.inner
            .config_repo
            .save(&config)
            .await
            .map_err(|e| ManagerError::Persist(format!("{:#}", e)))?;

        let mut lifecycle = self.inner.lifecycle.lock().await;
        let changed = *self.inner.config.read() != config;
        *self.inner.config.write() = config.clone();

        if lifecycle.is_some() && changed {
            tracing::info!("config changed, restarting as {}", config.role);
            self.inner.stop_locked(&mut lifecycle).await?;
            self.inner.start_locked(&mut lifecycle, config).await?;
        }
        Ok(())
    }

    // ==================== Peers ====================

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.inner.registry.read().list()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let registry = self.inner.registry.read().clone();
        self.inner.stats.read().snapshot(&registry, now_ms())
    }

    /// Add a peer by address.
    ///
    /// On a satellite without a live master link the new peer becomes the
    /// target when it is flagged as a master, or when no target is set and
    /// no master is known. Any other peer is only registered.
    pub async fn add_peer(
        &self,
        address: &str,
        port: Option<u16>,
        display_name: Option<String>,
        role: Option<NodeRole>,
    ) -> Result<PeerInfo, ManagerError> {
        let addr = parse_peer_address(address, port)?;
        let lifecycle = self.inner.lifecycle.lock().await;
        let running = lifecycle.as_ref().ok_or(ManagerError::NotRunning)?;

        let registry = self.inner.registry.read().clone();
        let known_master = registry.master_candidate();
        let peer = registry.add_manual(addr, display_name, role, now_ms());
        tracing::info!("added peer {} at {}", peer.id, addr);

        if let ActiveRole::Satellite(handler) = &running.role {
            let retarget = role == Some(NodeRole::Master)
                || (handler.status().target.is_none() && known_master.is_none());
            if retarget && !handler.is_connected() {
                handler.client().connect_to(addr).await?;
            }
        }
        Ok(peer)
    }

    pub async fn remove_peer(&self, id: &str) -> Result<PeerInfo, ManagerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let peer = self
            .inner
            .registry
            .read()
            .remove(id)
            .ok_or_else(|| ManagerError::UnknownPeer(id.to_string()))?;
        tracing::info!("removed peer {}", id);
        Ok(peer)
    }

    /// Point the satellite at a master and connect now.
    pub async fn connect_to_master(&self, address: &str, port: Option<u16>) -> Result<(), ManagerError> {
        let addr = parse_peer_address(address, port)?;
        let client = self.satellite_client().await?;
        self.inner
            .registry
            .read()
            .add_manual(addr, None, Some(NodeRole::Master), now_ms());
        client.connect_to(addr).await?;
        Ok(())
    }

    pub async fn disconnect_from_master(&self) -> Result<(), ManagerError> {
        self.satellite_client().await?.disconnect().await?;
        Ok(())
    }

    /// Satellite: skip the pending backoff delay and reconnect now.
    ///
    /// Also resumes a link paused by `disconnect_from_master`.
    pub async fn retry_now(&self) -> Result<(), ManagerError> {
        self.satellite_client().await?.retry_now().await?;
        Ok(())
    }

    /// Run a discovery announce and sweep cycle now.
    pub async fn refresh_discovery(&self) -> Result<(), ManagerError> {
        let lifecycle = self.inner.lifecycle.lock().await;
        let running = lifecycle.as_ref().ok_or(ManagerError::NotRunning)?;
        match &running.discovery {
            Some(discovery) => discovery.refresh(),
            None => tracing::debug!("discovery is not running"),
        }
        Ok(())
    }

    /// Satellite: request a fresh snapshot from the master.
    pub async fn force_resync(&self) -> Result<(), ManagerError> {
        self.satellite_client().await?.force_resync().await?;
        Ok(())
    }

    /// Check that a master is reachable and accepts our credentials.
    pub async fn probe_master(&self, address: &str, port: Option<u16>) -> Result<ProbeResult, ManagerError> {
        let addr = parse_peer_address(address, port)?;
        let config = self.get_config();
        Ok(satellite::probe_master(addr, &self.inner.identity, &config).await?)
    }

    /// Master: the satellites currently holding a session.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ManagerError> {
        let lifecycle = self.inner.lifecycle.lock().await;
        match &lifecycle.as_ref().ok_or(ManagerError::NotRunning)?.role {
            ActiveRole::Master(handler) => Ok(handler.sessions()),
            other => Err(ManagerError::RoleMismatch {
                expected: NodeRole::Master,
                actual: other.role(),
            }),
        }
    }

    async fn satellite_client(&self) -> Result<SatelliteClient, ManagerError> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle
            .as_ref()
            .ok_or(ManagerError::NotRunning)?
            .satellite()
    }

    // ==================== Mutations ====================

    /// Commit a local mutation.
    ///
    /// Standalone and Master commit locally; a Satellite forwards the
    /// mutation to its master and waits for the verdict.
    pub async fn propose(&self, mutation: Mutation) -> Result<CommitReceipt, ProposalError> {
        enum Target {
            Local(Arc<Authority>),
            Remote(SatelliteClient),
        }

        let target = {
            let lifecycle = self.inner.lifecycle.lock().await;
            match lifecycle.as_ref().map(|r| &r.role) {
                Some(ActiveRole::Standalone(authority)) => Target::Local(authority.clone()),
                Some(ActiveRole::Master(handler)) => Target::Local(handler.authority().clone()),
                Some(ActiveRole::Satellite(handler)) => Target::Remote(handler.client()),
                None => return Err(ProposalError::NotConnected),
            }
        };

        match target {
            Target::Local(authority) => authority.commit(mutation).await.map(|d| CommitReceipt::from(&d)),
            Target::Remote(client) => client.propose(mutation).await,
        }
    }

    /// Add `amount` (negative to remove) to a stock entity.
    pub async fn adjust_stock(&self, entity_id: &str, amount: f64) -> Result<CommitReceipt, ProposalError> {
        self.propose(Mutation::adjust(EntityKey::stock(entity_id), amount)).await
    }

    // ==================== Notifications ====================

    pub fn subscribe(
        &self,
        kind: NotificationKind,
        listener: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.hub.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.hub.unsubscribe(id)
    }
}

/// Parse `ip:port`, or `ip` plus an optional port (default sync port).
pub fn parse_peer_address(address: &str, port: Option<u16>) -> Result<SocketAddr, ManagerError> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(match port {
            Some(port) => SocketAddr::new(addr.ip(), port),
            None => addr,
        });
    }
    let ip: IpAddr = address
        .parse()
        .map_err(|_| ManagerError::InvalidAddress(address.to_string()))?;
    Ok(SocketAddr::new(ip, port.unwrap_or(DEFAULT_SYNC_PORT)))
}

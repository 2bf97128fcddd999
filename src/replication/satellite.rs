//! Satellite Role Handler
//!
//! Keeps one link to the master: connect, authenticate, install a
//! snapshot, then apply committed deltas in order. Local mutations are
//! sent to the master as proposals and only become visible once the
//! master's commit comes back.
//!
//! The handler is a single actor task. Callers talk to it over a command
//! channel, so the link, the replica state and the reconnect machine are
//! owned by one task and never shared.

use crate::domain::entities::{EntityKey, Mutation};
use crate::infrastructure::backoff::{LinkState, ReconnectMachine};
use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::authority::CommitReceipt;
use crate::replication::codec::{Handshake, Proposal, SyncMessage};
use crate::replication::config::NetworkModeConfig;
use crate::replication::context::RoleContext;
use crate::replication::error::{
    AuthError, ProposalError, ProtocolError, StartError, StopError, SyncError, TransportError,
};
use crate::replication::events::Notification;
use crate::replication::protocol::{
    apply_delta, build_handshake, install_snapshot, verify_handshake, ApplyOutcome, Liveness,
    ReplicaState,
};
use crate::replication::stats::StatsTracker;
use crate::replication::transport::{self, SyncLink};
use crate::replication::types::{now_ms, NodeId, NodeIdentity, NodeRole, PeerStatus};
use parking_lot::RwLock;
use quinn::Endpoint;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How often an idle satellite re-checks the registry for a master.
const IDLE_POLL: Duration = Duration::from_secs(1);

type ProposalReply = oneshot::Sender<Result<CommitReceipt, ProposalError>>;

enum Command {
    ConnectTo(SocketAddr),
    Disconnect,
    Propose {
        mutation: Mutation,
        reply: ProposalReply,
    },
    RetryNow,
    ForceResync(oneshot::Sender<Result<(), ProposalError>>),
}

/// Observable state of the satellite's master link.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteStatus {
    pub link: LinkState,
    pub master_id: Option<String>,
    pub master_address: Option<SocketAddr>,
    /// Explicit target, if one was configured or requested
    pub target: Option<SocketAddr>,
    /// Highest entity version applied locally
    pub applied_version: u64,
}

/// Result of a one-shot authenticated probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub node_id: NodeId,
    pub display_name: String,
    pub round_trip: Duration,
}

/// Cloneable handle for sending commands to the satellite task.
#[derive(Clone)]
pub struct SatelliteClient {
    control: mpsc::Sender<Command>,
    proposal_timeout: Duration,
}

impl SatelliteClient {
    /// Make `addr` the target and connect to it now.
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<(), ProposalError> {
        self.send(Command::ConnectTo(addr)).await
    }

    /// Drop the master link and stay disconnected until told otherwise.
    pub async fn disconnect(&self) -> Result<(), ProposalError> {
        self.send(Command::Disconnect).await
    }

    /// Skip the current backoff delay.
    pub async fn retry_now(&self) -> Result<(), ProposalError> {
        self.send(Command::RetryNow).await
    }

    /// Send a mutation to the master and wait for its verdict.
    pub async fn propose(&self, mutation: Mutation) -> Result<CommitReceipt, ProposalError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Propose { mutation, reply }).await?;
        match tokio::time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProposalError::Shutdown),
            Err(_) => Err(ProposalError::Timeout),
        }
    }

    /// Ask the master for a fresh snapshot over the live link.
    pub async fn force_resync(&self) -> Result<(), ProposalError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceResync(reply)).await?;
        rx.await.map_err(|_| ProposalError::Shutdown)?
    }

    async fn send(&self, command: Command) -> Result<(), ProposalError> {
        self.control
            .send(command)
            .await
            .map_err(|_| ProposalError::Shutdown)
    }
}

/// Read-only view of the satellite's link status.
#[derive(Clone)]
pub struct SatelliteStatusHandle(Arc<RwLock<SatelliteStatus>>);

impl SatelliteStatusHandle {
    pub fn get(&self) -> SatelliteStatus {
        self.0.read().clone()
    }
}

pub struct SatelliteHandler {
    client: SatelliteClient,
    status: Arc<RwLock<SatelliteStatus>>,
    shutdown: ShutdownController,
    task: JoinHandle<()>,
}

impl SatelliteHandler {
    /// Create the client endpoint and spawn the link task.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(ctx: RoleContext) -> Result<Self, StartError> {
        let endpoint = transport::client_endpoint(ctx.config.heartbeat_timeout * 2).map_err(|e| {
            StartError::Bind {
                addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                reason: format!("{:#}", e),
            }
        })?;

        let status = Arc::new(RwLock::new(SatelliteStatus {
            link: LinkState::Disconnected,
            master_id: None,
            master_address: None,
            target: ctx.config.target_addr,
            applied_version: 0,
        }));
        let (control, control_rx) = mpsc::channel(64);
        let shutdown = ShutdownController::new();
        let client = SatelliteClient {
            control,
            proposal_timeout: ctx.config.proposal_timeout,
        };

        let actor = SatelliteActor {
            target: ctx.config.target_addr,
            machine: ReconnectMachine::new(ctx.config.reconnect.clone()),
            ctx,
            endpoint,
            paused: false,
            replica: ReplicaState::new(),
            pending: HashMap::new(),
            next_proposal_id: 1,
            master: None,
            status: status.clone(),
            control: control_rx,
            shutdown: shutdown.clone(),
        };
        tracing::info!(
            "satellite started, target {}",
            actor.target.map_or("discovered master".to_string(), |a| a.to_string())
        );
        let task = tokio::spawn(actor.run());

        Ok(Self {
            client,
            status,
            shutdown,
            task,
        })
    }

    pub fn client(&self) -> SatelliteClient {
        self.client.clone()
    }

    pub fn status(&self) -> SatelliteStatus {
        self.status.read().clone()
    }

    pub fn status_handle(&self) -> SatelliteStatusHandle {
        SatelliteStatusHandle(self.status.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().link == LinkState::Connected
    }

    /// Close the link and wait for the task to exit.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn stop(self) -> Result<(), StopError> {
        self.shutdown.shutdown();
        self.task
            .await
            .map_err(|e| StopError::JoinFailed(e.to_string()))?;
        tracing::info!("satellite stopped");
        Ok(())
    }
}

/// How a live link ended.
enum LinkEnd {
    Shutdown,
    /// Caller asked to disconnect
    Disconnected,
    /// Caller picked another master
    Switched,
    /// Master closed the link on purpose
    MasterClosed(String),
}

struct SatelliteActor {
    ctx: RoleContext,
    endpoint: Endpoint,
    target: Option<SocketAddr>,
    machine: ReconnectMachine,
    /// Set by an explicit disconnect; no attempts until cleared
    paused: bool,
    replica: ReplicaState,
    pending: HashMap<u64, (EntityKey, ProposalReply)>,
    next_proposal_id: u64,
    master: Option<(String, SocketAddr)>,
    status: Arc<RwLock<SatelliteStatus>>,
    control: mpsc::Receiver<Command>,
    shutdown: ShutdownController,
}

impl SatelliteActor {
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(mut self) {
        while let Some(addr) = self.wait_for_attempt().await {
            match self.establish(addr).await {
                Ok((link, master)) => {
                    if !self.run_link(link, master).await {
                        break;
                    }
                }
                Err(e) => self.on_connect_failed(addr, e),
            }
        }

        self.fail_pending(ProposalError::Shutdown);
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        if tokio::time::timeout(self.ctx.config.drain_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            tracing::debug!("satellite endpoint did not go idle in time");
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.link = self.machine.state();
        status.master_id = self.master.as_ref().map(|(id, _)| id.clone());
        status.master_address = self.master.as_ref().map(|(_, addr)| *addr);
        status.target = self.target;
        status.applied_version = self.replica.watermark();
    }

    /// Where to connect next: the explicit target, else the best master
    /// the registry knows about. Stale and rejected peers are skipped.
    fn pick_target(&self) -> Option<SocketAddr> {
        match self.target {
            // A configured target keeps being retried after going Stale.
            Some(addr) => (!self.ctx.registry.is_rejected_address(addr)).then_some(addr),
            None => self.ctx.registry.master_candidate().map(|p| p.address),
        }
    }

    /// Wait until an attempt is due and a target is known.
    ///
    /// Returns `None` on shutdown.
    async fn wait_for_attempt(&mut self) -> Option<SocketAddr> {
        loop {
            if self.shutdown.is_shutdown() {
                return None;
            }

            let now = Instant::now();
            if !self.paused && self.machine.is_due(now) {
                if let Some(addr) = self.pick_target() {
                    return Some(addr);
                }
            }

            let wake_at = match self.machine.next_retry_at() {
                Some(at) if at > now && !self.paused => at,
                _ => now + IDLE_POLL,
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,

                command = self.control.recv() => match command {
                    Some(command) => self.handle_idle_command(command),
                    None => return None,
                },

                _ = self.ctx.registry.changed() => {}

                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => {}
            }
        }
    }

    fn handle_idle_command(&mut self, command: Command) {
        match command {
            Command::ConnectTo(addr) => {
                tracing::info!("connecting to master at {}", addr);
                self.target = Some(addr);
                self.paused = false;
                self.machine.on_disconnected();
            }
            Command::Disconnect => {
                self.paused = true;
                self.machine.on_disconnected();
            }
            Command::RetryNow => {
                self.paused = false;
                self.machine.retry_now(Instant::now());
            }
            Command::Propose { reply, .. } => {
                let _ = reply.send(Err(ProposalError::NotConnected));
            }
            Command::ForceResync(reply) => {
                let _ = reply.send(Err(ProposalError::NotConnected));
            }
        }
        self.publish_status();
    }

    async fn establish(&mut self, addr: SocketAddr) -> Result<(SyncLink, Handshake), SyncError> {
        let registry = &self.ctx.registry;
        let peer = match registry.find_by_address(addr) {
            Some(peer) => peer,
            None => registry.add_manual(addr, None, Some(NodeRole::Master), now_ms()),
        };
        registry.set_status(&peer.id, PeerStatus::Connecting);

        tracing::debug!("connecting to master {}", addr);
        let mut link = tokio::time::timeout(
            self.ctx.config.handshake_timeout,
            transport::connect(&self.endpoint, addr, self.ctx.stats.clone()),
        )
        .await
        .map_err(|_| TransportError::Timeout("connect"))??;

        let master = match client_handshake(
            &mut link,
            &self.ctx.identity,
            &self.ctx.config.display_name,
            self.ctx.config.handshake_timeout,
        )
        .await
        {
            Ok(master) => master,
            Err(e) => {
                link.close("handshake failed");
                return Err(e);
            }
        };

        self.ctx.registry.record_handshake(
            &master.node_id,
            addr,
            true,
            NodeRole::Master,
            &master.display_name,
            now_ms(),
        );
        Ok((link, master))
    }

    fn on_connect_failed(&mut self, addr: SocketAddr, err: SyncError) {
        match &err {
            SyncError::Auth(_) => {
                tracing::warn!("master at {} refused authentication: {}", addr, err);
                self.ctx.registry.mark_rejected(None, addr);
                self.ctx.report_error(format!("master at {} rejected: {}", addr, err));
            }
            _ => {
                tracing::info!("connect to {} failed: {}", addr, err);
                if let Some(peer) = self.ctx.registry.find_by_address(addr) {
                    self.ctx.registry.mark_stale(&peer.id);
                }
                self.ctx.stats.record_error(now_ms(), err.to_string());
            }
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let (attempt, delay) = self.machine.schedule_retry(Instant::now());
        self.ctx.stats.record_reconnect_attempt();
        self.ctx.hub.emit(Notification::Reconnecting { attempt });
        tracing::info!("reconnecting in {:?} (attempt {})", delay, attempt);
        self.publish_status();
    }

    fn fail_pending(&mut self, err: ProposalError) {
        for (_, (_, reply)) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }

    /// Run a connected link until it ends. Returns `false` on shutdown.
    async fn run_link(&mut self, mut link: SyncLink, master: Handshake) -> bool {
        let addr = link.remote_address();
        tracing::info!("connected to master {} ({}) at {}", master.node_id, master.display_name, addr);
        self.master = Some((master.node_id.clone(), addr));
        self.machine.on_connected();
        self.publish_status();

        let result = self.link_loop(&mut link, &master.node_id).await;

        self.master = None;
        self.fail_pending(ProposalError::NotConnected);
        let keep_running = match result {
            Ok(LinkEnd::Shutdown) => {
                link.close_with(SyncMessage::error("shutdown"), "shutdown").await;
                self.machine.on_disconnected();
                false
            }
            Ok(LinkEnd::Disconnected) => {
                link.close_with(SyncMessage::error("shutdown"), "disconnect").await;
                self.ctx.registry.mark_stale(&master.node_id);
                self.paused = true;
                self.machine.on_disconnected();
                true
            }
            Ok(LinkEnd::Switched) => {
                link.close_with(SyncMessage::error("shutdown"), "switch").await;
                self.ctx.registry.mark_stale(&master.node_id);
                self.machine.on_disconnected();
                true
            }
            Ok(LinkEnd::MasterClosed(reason)) => {
                tracing::info!("master closed the link: {}", reason);
                link.close("closed");
                self.ctx.registry.mark_stale(&master.node_id);
                self.machine.on_disconnected();
                self.schedule_retry();
                true
            }
            Err(SyncError::Store(e)) => {
                link.close("store failure");
                self.machine.on_disconnected();
                self.ctx.fatal(SyncError::Store(e));
                false
            }
            Err(e) => {
                tracing::warn!("master link failed: {}", e);
                link.close("error");
                self.ctx.registry.mark_stale(&master.node_id);
                self.ctx.report_error(format!("lost master link: {}", e));
                self.machine.on_disconnected();
                self.schedule_retry();
                true
            }
        };
        self.publish_status();
        keep_running
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn link_loop(&mut self, link: &mut SyncLink, master_id: &str) -> Result<LinkEnd, SyncError> {
        let config = self.ctx.config.clone();
        let mut liveness = Liveness::new(config.heartbeat_timeout);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );

        self.replica.request_snapshot();
        link.send(SyncMessage::SnapshotRequest).await?;
        let mut snapshot_deadline = Some(Instant::now() + config.snapshot_timeout);

        loop {
            let expires_at = tokio::time::Instant::from_std(liveness.deadline());
            let snapshot_at =
                tokio::time::Instant::from_std(snapshot_deadline.unwrap_or_else(|| liveness.deadline()));

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(LinkEnd::Shutdown),

                command = self.control.recv() => {
                    let Some(command) = command else {
                        return Ok(LinkEnd::Shutdown);
                    };
                    match command {
                        Command::Propose { mutation, reply } => {
                            let proposal_id = self.next_proposal_id;
                            self.next_proposal_id += 1;
                            let key = mutation.key.clone();
                            link.send(SyncMessage::DeltaProposal(Proposal { proposal_id, mutation })).await?;
                            self.pending.insert(proposal_id, (key, reply));
                        }
                        Command::ForceResync(reply) => {
                            tracing::info!("resync requested");
                            self.replica.request_snapshot();
                            let sent = link.send(SyncMessage::SnapshotRequest).await;
                            let _ = reply.send(Ok(()));
                            sent?;
                            snapshot_deadline = Some(Instant::now() + config.snapshot_timeout);
                        }
                        Command::Disconnect => return Ok(LinkEnd::Disconnected),
                        Command::ConnectTo(addr) => {
                            self.target = Some(addr);
                            if addr != link.remote_address() {
                                return Ok(LinkEnd::Switched);
                            }
                        }
                        Command::RetryNow => {}
                    }
                }

                msg = link.receiver.recv() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e),
                        None => return Err(TransportError::Closed.into()),
                    };
                    liveness.touch();
                    self.ctx.registry.touch(master_id, now_ms());

                    match msg {
                        SyncMessage::SnapshotResponse(snapshot) => {
                            install_snapshot(self.ctx.store.as_ref(), &mut self.replica, &snapshot).await?;
                            snapshot_deadline = None;
                            let at_ms = now_ms();
                            self.ctx.stats.record_sync(at_ms);
                            self.ctx.hub.emit(Notification::SyncCompleted { at_ms });
                            tracing::info!(
                                "synced {} entities at version {}",
                                snapshot.live_count(),
                                snapshot.entity_version
                            );
                            self.publish_status();
                        }
                        SyncMessage::DeltaCommit(delta) => {
                            match apply_delta(self.ctx.store.as_ref(), &mut self.replica, &delta).await? {
                                ApplyOutcome::Applied(value) => {
                                    self.ctx.hub.emit(Notification::StockUpdated {
                                        entity: delta.key.clone(),
                                        quantity: value.map(|v| v.quantity),
                                        version: delta.entity_version,
                                    });
                                    self.publish_status();
                                }
                                ApplyOutcome::Skipped(decision) => {
                                    tracing::trace!("skipped {} v{}: {:?}", delta.key, delta.entity_version, decision);
                                }
                                ApplyOutcome::NeedsSnapshot => {
                                    link.send(SyncMessage::SnapshotRequest).await?;
                                    snapshot_deadline = Some(Instant::now() + config.snapshot_timeout);
                                }
                            }
                        }
                        SyncMessage::Ack { proposal_id, entity_version } => {
                            if let Some((entity, reply)) = self.pending.remove(&proposal_id) {
                                let _ = reply.send(Ok(CommitReceipt { entity, entity_version }));
                            }
                        }
                        SyncMessage::Error(body) => match body.proposal_id {
                            Some(proposal_id) => {
                                if let Some((_, reply)) = self.pending.remove(&proposal_id) {
                                    let _ = reply.send(Err(ProposalError::Rejected { reason: body.reason }));
                                }
                            }
                            None => return Ok(LinkEnd::MasterClosed(body.reason)),
                        },
                        SyncMessage::Heartbeat => {}
                        other => {
                            return Err(ProtocolError::Unexpected(other.kind().as_str()).into());
                        }
                    }
                }

                _ = heartbeat.tick() => link.send(SyncMessage::Heartbeat).await?,

                _ = tokio::time::sleep_until(expires_at) => {
                    return Err(ProtocolError::HeartbeatTimeout.into());
                }

                _ = tokio::time::sleep_until(snapshot_at), if snapshot_deadline.is_some() => {
                    return Err(ProtocolError::SnapshotTimeout.into());
                }
            }
        }
    }
}

/// Run the initiator side of the handshake and verify the master's reply.
pub async fn client_handshake(
    link: &mut SyncLink,
    identity: &NodeIdentity,
    display_name: &str,
    timeout: Duration,
) -> Result<Handshake, SyncError> {
    let ours = build_handshake(identity, NodeRole::Satellite, display_name)?;
    link.send(SyncMessage::Handshake(ours)).await?;

    match link.recv_timeout(timeout, "handshake").await? {
        SyncMessage::Handshake(theirs) => {
            verify_handshake(identity.shared_secret(), &theirs)?;
            if theirs.role != NodeRole::Master {
                return Err(AuthError::RejectedByPeer(format!("peer is {}, not master", theirs.role)).into());
            }
            Ok(theirs)
        }
        SyncMessage::Error(body) => Err(AuthError::RejectedByPeer(body.reason).into()),
        other => Err(AuthError::UnexpectedMessage(other.kind().as_str()).into()),
    }
}

/// Connect to `addr`, authenticate, and disconnect again.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn probe_master(
    addr: SocketAddr,
    identity: &NodeIdentity,
    config: &NetworkModeConfig,
) -> Result<ProbeResult, SyncError> {
    let endpoint = transport::client_endpoint(config.handshake_timeout * 2)
        .map_err(|e| TransportError::Io(format!("{:#}", e)))?;

    let started = Instant::now();
    let mut link = tokio::time::timeout(
        config.handshake_timeout,
        transport::connect(&endpoint, addr, Arc::new(StatsTracker::new())),
    )
    .await
    .map_err(|_| TransportError::Timeout("connect"))??;

    let result = client_handshake(&mut link, identity, &config.display_name, config.handshake_timeout).await;
    let round_trip = started.elapsed();
    link.close_with(SyncMessage::error("shutdown"), "probe").await;
    endpoint.close(quinn::VarInt::from_u32(0), b"probe");

    let master = result?;
    tracing::debug!("probed master {} at {} in {:?}", master.node_id, addr, round_trip);
    Ok(ProbeResult {
        node_id: NodeId::new(master.node_id),
        display_name: master.display_name,
        round_trip,
    })
}

//! Master Role Handler
//!
//! Listens for satellites, authenticates them and runs one session task
//! per connection. A session serves snapshots, forwards every committed
//! delta and submits the satellite's proposals to the shared `Authority`.
//!
//! A failing session only affects its own peer: it is dropped, the peer
//! is marked Stale, and the other sessions keep running.

use crate::domain::entities::Delta;
use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::authority::Authority;
use crate::replication::codec::{ErrorBody, Handshake, Proposal, SyncMessage};
use crate::replication::context::RoleContext;
use crate::replication::config::ConfigError;
use crate::replication::error::{
    AuthError, ProposalError, ProtocolError, StartError, StopError, SyncError, TransportError,
};
use crate::replication::events::Notification;
use crate::replication::protocol::{auth_failure_reason, build_handshake, verify_handshake, Liveness};
use crate::replication::transport::{self, SyncLink};
use crate::replication::types::{now_ms, NodeRole};
use dashmap::DashMap;
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

/// A live, authenticated satellite session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub peer_id: String,
    pub display_name: String,
    pub remote_address: SocketAddr,
}

struct MasterShared {
    ctx: RoleContext,
    authority: Arc<Authority>,
    sessions: DashMap<u64, SessionInfo>,
    next_session_id: AtomicU64,
    shutdown: ShutdownController,
}

/// Why a session loop ended without an error.
enum SessionEnd {
    Shutdown,
    PeerClosed,
}

pub struct MasterHandler {
    shared: Arc<MasterShared>,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MasterHandler {
    /// Bind the listening endpoint and start accepting satellites.
    ///
    /// Binding happens before this returns so a taken port surfaces as a
    /// start error.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(ctx: RoleContext, authority: Arc<Authority>) -> Result<Self, StartError> {
        let addr = ctx.config.bind_addr.ok_or(StartError::InvalidConfig(ConfigError::MissingBindAddr))?;
        let idle_timeout = ctx.config.heartbeat_timeout * 2;

        let endpoint = transport::listen(addr, idle_timeout).map_err(|e| StartError::Bind {
            addr,
            reason: format!("{:#}", e),
        })?;
        let local_addr = endpoint.local_addr().map_err(|e| StartError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        tracing::info!("master listening on {}", local_addr);

        let shared = Arc::new(MasterShared {
            ctx,
            authority,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            shutdown: ShutdownController::new(),
        });
        let accept_task = tokio::spawn(accept_loop(shared.clone(), endpoint.clone()));

        Ok(Self {
            shared,
            endpoint,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.shared.authority
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.shared.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        sessions
    }

    /// Close every session and release the listening socket.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn stop(self) -> Result<(), StopError> {
        let drain_timeout = self.shared.ctx.config.drain_timeout;
        self.shared.shutdown.shutdown();

        if !self.shared.shutdown.wait_for_drain(drain_timeout).await {
            tracing::warn!("closing {} sessions without drain", self.shared.sessions.len());
        }

        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        if tokio::time::timeout(drain_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            tracing::debug!("endpoint did not go idle in time");
        }

        self.accept_task
            .await
            .map_err(|e| StopError::JoinFailed(e.to_string()))?;
        tracing::info!("master stopped");
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn accept_loop(shared: Arc<MasterShared>, endpoint: Endpoint) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,

            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    if !shared.shutdown.is_shutdown() {
                        shared.ctx.fatal(TransportError::Closed.into());
                    }
                    break;
                };
                tracing::debug!("incoming connection from {}", incoming.remote_address());
                tokio::spawn(run_session(shared.clone(), incoming));
            }
        }
    }
    tracing::debug!("accept loop ended");
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn run_session(shared: Arc<MasterShared>, incoming: quinn::Incoming) {
    let _guard = shared.shutdown.session_guard();
    let config = &shared.ctx.config;
    let remote = incoming.remote_address();

    let accepted = tokio::time::timeout(
        config.handshake_timeout,
        transport::accept(incoming, shared.ctx.stats.clone()),
    )
    .await;
    let mut link = match accepted {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            tracing::debug!("accept from {} failed: {}", remote, e);
            return;
        }
        Err(_) => {
            tracing::debug!("accept from {} timed out", remote);
            return;
        }
    };

    let peer = match authenticate(&shared, &mut link).await {
        Ok(peer) => peer,
        Err((e, reply)) => {
            tracing::warn!("handshake with {} failed: {}", remote, e);
            shared.ctx.stats.record_error(now_ms(), format!("handshake with {} failed: {}", remote, e));
            match reply {
                Some(msg) => link.close_with(msg, "handshake failed").await,
                None => link.close("handshake failed"),
            }
            return;
        }
    };

    let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
    shared.sessions.insert(
        session_id,
        SessionInfo {
            peer_id: peer.node_id.clone(),
            display_name: peer.display_name.clone(),
            remote_address: remote,
        },
    );
    tracing::info!("satellite {} ({}) connected from {}", peer.node_id, peer.display_name, remote);

    let result = session_loop(&shared, &mut link, &peer.node_id).await;
    shared.sessions.remove(&session_id);

    match result {
        Ok(SessionEnd::Shutdown) => {
            link.close_with(SyncMessage::error("shutdown"), "shutdown").await;
        }
        Ok(SessionEnd::PeerClosed) => {
            tracing::info!("satellite {} disconnected", peer.node_id);
            shared.ctx.registry.mark_stale(&peer.node_id);
            link.close("closed");
        }
        Err(e) => {
            tracing::warn!("session with {} failed: {}", peer.node_id, e);
            shared.ctx.registry.mark_stale(&peer.node_id);
            shared.ctx.report_error(format!("satellite {} dropped: {}", peer.display_name, e));
            let reason = match e {
                SyncError::Protocol(_) => "protocol_error",
                _ => "session_error",
            };
            link.close_with(SyncMessage::error(reason), reason).await;
        }
    }
}

/// Verify the satellite's handshake and answer with ours.
///
/// On failure returns the error and the reply to send before closing.
async fn authenticate(
    shared: &MasterShared,
    link: &mut SyncLink,
) -> Result<Handshake, (SyncError, Option<SyncMessage>)> {
    let ctx = &shared.ctx;
    let remote = link.remote_address();

    let handshake = match link.recv_timeout(ctx.config.handshake_timeout, "handshake").await {
        Ok(SyncMessage::Handshake(handshake)) => handshake,
        Ok(other) => {
            let err = AuthError::UnexpectedMessage(other.kind().as_str());
            return Err((err.into(), Some(SyncMessage::error("auth_failed"))));
        }
        Err(e) => return Err((e, None)),
    };

    if let Err(e) = verify_handshake(ctx.identity.shared_secret(), &handshake) {
        tracing::debug!(
            "rejecting {} ({}): proof {}",
            handshake.node_id,
            handshake.display_name,
            hex::encode(&handshake.proof)
        );
        ctx.registry.mark_rejected(Some(&handshake.node_id), remote);
        let reply = SyncMessage::error(auth_failure_reason(&e));
        return Err((e.into(), Some(reply)));
    }

    let ours = build_handshake(&ctx.identity, NodeRole::Master, &ctx.config.display_name)
        .map_err(|e| (SyncError::from(e), None::<SyncMessage>))?;
    link.send(SyncMessage::Handshake(ours))
        .await
        .map_err(|e| (e, None))?;

    ctx.registry.record_handshake(
        &handshake.node_id,
        remote,
        false,
        handshake.role,
        &handshake.display_name,
        now_ms(),
    );
    Ok(handshake)
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn session_loop(
    shared: &MasterShared,
    link: &mut SyncLink,
    peer_id: &str,
) -> Result<SessionEnd, SyncError> {
    let ctx = &shared.ctx;
    let mut commits = shared.authority.subscribe();
    let mut liveness = Liveness::new(ctx.config.heartbeat_timeout);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.config.heartbeat_interval,
        ctx.config.heartbeat_interval,
    );
    let mut synced = false;

    loop {
        let expires_at = tokio::time::Instant::from_std(liveness.deadline());

        tokio::select! {
            _ = shared.shutdown.cancelled() => return Ok(SessionEnd::Shutdown),

            msg = link.receiver.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(SyncError::Transport(TransportError::Closed))) | None => {
                        return Ok(SessionEnd::PeerClosed);
                    }
                    Some(Err(e)) => return Err(e),
                };
                liveness.touch();
                ctx.registry.touch(peer_id, now_ms());

                match msg {
                    SyncMessage::SnapshotRequest => {
                        commits = send_snapshot(shared, link).await?;
                        if !synced {
                            synced = true;
                            let at_ms = now_ms();
                            ctx.stats.record_sync(at_ms);
                            ctx.hub.emit(Notification::SyncCompleted { at_ms });
                        }
                    }
                    SyncMessage::DeltaProposal(proposal) => {
                        handle_proposal(shared, link, &mut commits, proposal).await?;
                    }
                    SyncMessage::Heartbeat => {}
                    SyncMessage::Error(body) if body.reason == "shutdown" => {
                        return Ok(SessionEnd::PeerClosed);
                    }
                    SyncMessage::Error(body) => {
                        tracing::warn!("satellite {} reported {}: {}", peer_id, body.reason, body.message);
                    }
                    other => {
                        return Err(ProtocolError::Unexpected(other.kind().as_str()).into());
                    }
                }
            }

            result = commits.recv() => {
                match result {
                    Ok(delta) => link.send(SyncMessage::DeltaCommit(delta)).await?,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("session {} lagged by {} commits, resending snapshot", peer_id, missed);
                        commits = send_snapshot(shared, link).await?;
                    }
                    Err(RecvError::Closed) => return Ok(SessionEnd::Shutdown),
                }
            }

            _ = heartbeat.tick() => link.send(SyncMessage::Heartbeat).await?,

            _ = tokio::time::sleep_until(expires_at) => {
                tracing::info!("satellite {} missed heartbeats", peer_id);
                return Err(ProtocolError::HeartbeatTimeout.into());
            }
        }
    }
}

/// Send a fresh snapshot and return the subscription that continues it.
async fn send_snapshot(
    shared: &MasterShared,
    link: &mut SyncLink,
) -> Result<broadcast::Receiver<Delta>, SyncError> {
    let (snapshot, commits) = shared.authority.snapshot_and_subscribe().await?;
    tracing::debug!(
        "sending snapshot with {} records at version {}",
        snapshot.records.len(),
        snapshot.entity_version
    );
    link.send(SyncMessage::SnapshotResponse(snapshot)).await?;
    Ok(commits)
}

/// Commit a satellite's proposal and answer it.
///
/// Pending commits, the new one included, are forwarded before the Ack so
/// the proposer has applied its own delta when the Ack arrives.
async fn handle_proposal(
    shared: &MasterShared,
    link: &mut SyncLink,
    commits: &mut broadcast::Receiver<Delta>,
    proposal: Proposal,
) -> Result<(), SyncError> {
    let proposal_id = proposal.proposal_id;

    let reply = match shared.authority.commit(proposal.mutation).await {
        Ok(delta) => {
            loop {
                match commits.try_recv() {
                    Ok(pending) => link.send(SyncMessage::DeltaCommit(pending)).await?,
                    Err(TryRecvError::Lagged(_)) => {
                        *commits = send_snapshot(shared, link).await?;
                        break;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            SyncMessage::Ack {
                proposal_id,
                entity_version: delta.entity_version,
            }
        }
        Err(ProposalError::Rejected { reason }) => {
            SyncMessage::Error(ErrorBody::new(reason).for_proposal(proposal_id))
        }
        Err(e) => {
            tracing::error!("commit of proposal {} failed: {}", proposal_id, e);
            SyncMessage::Error(
                ErrorBody::new("internal_error")
                    .for_proposal(proposal_id)
                    .with_message(e.to_string()),
            )
        }
    };

    link.send(reply).await
}

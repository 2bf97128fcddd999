//! Commit Authority
//!
//! The single writer for the shared entity state. Standalone and Master
//! nodes commit every mutation through one `Authority`; proposals from
//! satellites are funnelled into it by the master sessions.
//!
//! Validation, version assignment and the durable write happen under one
//! lock, so two proposals that conflict with each other can never both
//! commit. Committed deltas are then fanned out through a broadcast
//! channel; a slow subscriber lags instead of blocking the writer.

use crate::domain::entities::{Delta, EntityKey, EntityRecord, Mutation, Snapshot};
use crate::domain::ports::SyncStore;
use crate::replication::error::{ProposalError, SyncError};
use crate::replication::events::{Notification, NotificationHub};
use crate::replication::protocol::resolve_operation;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Capacity of the commit fan-out channel.
const COMMIT_CHANNEL_CAPACITY: usize = 1024;

/// Result of a committed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitReceipt {
    pub entity: EntityKey,
    pub entity_version: u64,
}

impl From<&Delta> for CommitReceipt {
    fn from(delta: &Delta) -> Self {
        Self {
            entity: delta.key.clone(),
            entity_version: delta.entity_version,
        }
    }
}

pub struct Authority {
    store: Arc<dyn SyncStore>,
    hub: Arc<NotificationHub>,
    write_lock: Mutex<()>,
    commits: broadcast::Sender<Delta>,
}

impl Authority {
    pub fn new(store: Arc<dyn SyncStore>, hub: Arc<NotificationHub>) -> Arc<Self> {
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            hub,
            write_lock: Mutex::new(()),
            commits,
        })
    }

    /// Receive every delta committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.commits.subscribe()
    }

    /// Validate and commit a mutation.
    ///
    /// The new version is the entity's current version plus one; deleted
    /// entities keep their version as a tombstone so a re-created entity
    /// continues the sequence.
    pub async fn commit(&self, mutation: Mutation) -> Result<Delta, ProposalError> {
        let _guard = self.write_lock.lock().await;

        let current = self
            .store
            .get(&mutation.key)
            .await
            .map_err(|e| ProposalError::Store(format!("{:#}", e)))?;
        let current_value = current.as_ref().and_then(|r| r.value.as_ref());

        let value = resolve_operation(&mutation.key, &mutation.operation, current_value)
            .inspect_err(|e| tracing::debug!("rejected {} on {}: {}", mutation.operation.name(), mutation.key, e))?;

        let version = current.map_or(0, |r| r.version) + 1;
        let delta = mutation.commit(version);

        self.store
            .write(EntityRecord {
                key: delta.key.clone(),
                value: value.clone(),
                version,
            })
            .await
            .map_err(|e| ProposalError::Store(format!("{:#}", e)))?;

        // No subscribers is fine: a standalone node has none.
        let _ = self.commits.send(delta.clone());
        tracing::debug!("committed {} {} v{}", delta.operation.name(), delta.key, version);

        self.hub.emit(Notification::StockUpdated {
            entity: delta.key.clone(),
            quantity: value.map(|v| v.quantity),
            version,
        });

        Ok(delta)
    }

    /// Current state of every entity.
    pub async fn snapshot(&self) -> Result<Snapshot, SyncError> {
        let _guard = self.write_lock.lock().await;
        self.store.snapshot().await.map_err(SyncError::store)
    }

    /// Take a snapshot and a subscription with no commit in between.
    ///
    /// Every delta the receiver yields is newer than the snapshot.
    pub async fn snapshot_and_subscribe(
        &self,
    ) -> Result<(Snapshot, broadcast::Receiver<Delta>), SyncError> {
        let _guard = self.write_lock.lock().await;
        let commits = self.commits.subscribe();
        let snapshot = self.store.snapshot().await.map_err(SyncError::store)?;
        Ok((snapshot, commits))
    }
}

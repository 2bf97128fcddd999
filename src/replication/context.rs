//! Shared state handed to a role handler for one run.

use crate::domain::ports::SyncStore;
use crate::replication::config::NetworkModeConfig;
use crate::replication::error::SyncError;
use crate::replication::events::{Notification, NotificationHub};
use crate::replication::registry::PeerRegistry;
use crate::replication::stats::StatsTracker;
use crate::replication::types::{now_ms, NodeIdentity};
use std::sync::Arc;

/// Called when a handler hits an error it cannot recover from.
pub type FatalHook = Arc<dyn Fn(SyncError) + Send + Sync>;

#[derive(Clone)]
pub struct RoleContext {
    pub identity: NodeIdentity,
    pub config: NetworkModeConfig,
    pub store: Arc<dyn SyncStore>,
    pub registry: Arc<PeerRegistry>,
    pub hub: Arc<NotificationHub>,
    pub stats: Arc<StatsTracker>,
    pub on_fatal: FatalHook,
}

impl RoleContext {
    /// Record a recoverable error and surface it to listeners.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.stats.record_error(now_ms(), message.clone());
        self.hub.emit(Notification::error(message));
    }

    /// Report an unrecoverable error to the owner of the handler.
    pub fn fatal(&self, err: SyncError) {
        tracing::error!("sync handler failed: {}", err);
        (self.on_fatal)(err);
    }
}

//! Sync Store Port
//!
//! Defines the interface to the local persistent store that holds the
//! synchronized entities. On the master it is the source of truth; on a
//! satellite it is a mirror that is only written by applied deltas and
//! snapshots.

use crate::domain::entities::{EntityKey, EntityRecord, Snapshot};
use async_trait::async_trait;

/// Local store for synchronized entities.
///
/// Writes must be durable when the call returns: the master broadcasts a
/// delta only after `write` succeeds.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Get a record by key, including tombstones.
    async fn get(&self, key: &EntityKey) -> anyhow::Result<Option<EntityRecord>>;

    /// Insert or replace a record (a `None` value stores a tombstone).
    async fn write(&self, record: EntityRecord) -> anyhow::Result<()>;

    /// Export every record, tombstones included.
    async fn snapshot(&self) -> anyhow::Result<Snapshot>;

    /// Replace the whole store with the snapshot contents.
    async fn replace_all(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

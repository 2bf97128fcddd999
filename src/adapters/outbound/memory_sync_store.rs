//! In-Memory Sync Store
//!
//! Implements SyncStore using DashMap for concurrent access.
//! Used by tests and by terminals running without a database file.

use crate::domain::entities::{EntityKey, EntityRecord, Snapshot};
use crate::domain::ports::SyncStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// DashMap-backed sync store.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    records: Arc<DashMap<EntityKey, EntityRecord>>,
}

impl MemorySyncStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with records.
    pub fn with_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.key.clone(), record);
        }
        store
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get(&self, key: &EntityKey) -> anyhow::Result<Option<EntityRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn write(&self, record: EntityRecord) -> anyhow::Result<()> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let records = self.records.iter().map(|r| r.value().clone()).collect();
        Ok(Snapshot::new(records))
    }

    async fn replace_all(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.records.clear();
        for record in &snapshot.records {
            self.records.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::EntityValue;

    fn record(id: &str, quantity: f64, version: u64) -> EntityRecord {
        EntityRecord {
            key: EntityKey::stock(id),
            value: Some(EntityValue::new(quantity)),
            version,
        }
    }

    #[tokio::test]
    async fn test_write_and_get() {
        let store = MemorySyncStore::new();
        assert!(store.is_empty());

        store.write(record("sku-1", 5.0, 1)).await.unwrap();

        let got = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert!(store.get(&EntityKey::stock("sku-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_all_drops_old_records() {
        let store = MemorySyncStore::with_records(vec![record("a", 1.0, 1), record("b", 2.0, 1)]);
        assert_eq!(store.len(), 2);

        store
            .replace_all(&Snapshot::new(vec![record("c", 3.0, 4)]))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.entity_version, 4);
        assert!(store.get(&EntityKey::stock("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemorySyncStore::new();
        let clone = store.clone();
        store.write(record("a", 1.0, 1)).await.unwrap();
        assert_eq!(clone.len(), 1);
    }
}

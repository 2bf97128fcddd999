//! SQLite Sync Store
//!
//! Implements SyncStore on a local SQLite database. Deleted entities are
//! kept as tombstones (`deleted = 1`) so their version survives.

use crate::domain::entities::{EntityKey, EntityRecord, EntityValue, Snapshot};
use crate::domain::ports::SyncStore;
use crate::replication::types::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_entities (
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    quantity    REAL,
    data        TEXT,
    version     INTEGER NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
";

/// SQLite-backed sync store.
///
/// All statements run on the blocking pool; the connection is shared
/// behind a mutex so writes are serialized.
#[derive(Clone)]
pub struct SqliteSyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSyncStore {
    /// Open (or create) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sync store {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<EntityRecord> {
        let deleted: i64 = row.get(5)?;
        let value = if deleted != 0 {
            None
        } else {
            Some(EntityValue {
                quantity: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                data: row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "{}".to_string()),
            })
        };

        Ok(EntityRecord {
            key: EntityKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            value,
            version: row.get::<_, i64>(4)? as u64,
        })
    }

    fn upsert(conn: &Connection, record: &EntityRecord, updated_at: u64) -> rusqlite::Result<()> {
        let (quantity, data, deleted) = match &record.value {
            Some(v) => (Some(v.quantity), Some(v.data.as_str()), 0),
            None => (None, None, 1),
        };
        conn.execute(
            "INSERT INTO sync_entities
                (entity_type, entity_id, quantity, data, version, deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                quantity = excluded.quantity,
                data = excluded.data,
                version = excluded.version,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            params![
                record.key.entity_type,
                record.key.entity_id,
                quantity,
                data,
                record.version as i64,
                deleted,
                updated_at as i64,
            ],
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("sqlite task panicked")?
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT entity_type, entity_id, quantity, data, version, deleted
                     FROM sync_entities WHERE entity_type = ?1 AND entity_id = ?2",
                    params![key.entity_type, key.entity_id],
                    Self::row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn write(&self, record: EntityRecord) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            Self::upsert(&tx, &record, now_ms())?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, entity_id, quantity, data, version, deleted
                 FROM sync_entities",
            )?;
            let records = stmt
                .query_map([], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Snapshot::new(records))
        })
        .await
    }

    async fn replace_all(&self, snapshot: &Snapshot) -> Result<()> {
        let records = snapshot.records.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM sync_entities", [])?;
            let now = now_ms();
            for record in &records {
                Self::upsert(&tx, record, now)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, quantity: f64, version: u64) -> EntityRecord {
        EntityRecord {
            key: EntityKey::stock(id),
            value: Some(EntityValue::new(quantity).with_data(r#"{"name":"bolt"}"#)),
            version,
        }
    }

    #[tokio::test]
    async fn test_write_get_roundtrip() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        store.write(record("sku-1", 5.0, 5)).await.unwrap();

        let got = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert_eq!(got, record("sku-1", 5.0, 5));
        assert!(store.get(&EntityKey::stock("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_keeps_version() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        store.write(record("sku-1", 5.0, 1)).await.unwrap();
        store
            .write(EntityRecord {
                key: EntityKey::stock("sku-1"),
                value: None,
                version: 2,
            })
            .await
            .unwrap();

        let got = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert!(got.is_tombstone());
        assert_eq!(got.version, 2);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.live_count(), 0);
        assert_eq!(snapshot.entity_version, 2);
    }

    #[tokio::test]
    async fn test_replace_all() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        store.write(record("old", 1.0, 1)).await.unwrap();

        let snapshot = Snapshot::new(vec![record("a", 2.0, 3), record("b", 4.0, 9)]);
        store.replace_all(&snapshot).await.unwrap();

        let exported = store.snapshot().await.unwrap();
        assert_eq!(exported, snapshot);
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = SqliteSyncStore::open(&path).unwrap();
            store.write(record("sku-1", 7.0, 3)).await.unwrap();
        }

        let store = SqliteSyncStore::open(&path).unwrap();
        let got = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert_eq!(got.value.unwrap().quantity, 7.0);
    }
}

//! Domain Entities - Synchronized business state
//!
//! These entities describe the state shared between terminals: versioned
//! entity records, the changes applied to them, and full snapshots.
//! They have no I/O dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity type used for inventory levels.
pub const STOCK_ENTITY: &str = "stock";

/// Identifies one synchronized entity, e.g. `stock:sku-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Key for a stock level entry.
    pub fn stock(entity_id: impl Into<String>) -> Self {
        Self::new(STOCK_ENTITY, entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Current value of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityValue {
    /// Numeric level (stock on hand for inventory entities)
    pub quantity: f64,
    /// Additional attributes as a JSON document
    pub data: String,
}

impl EntityValue {
    pub fn new(quantity: f64) -> Self {
        Self {
            quantity,
            data: "{}".to_string(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

/// Operation carried by a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOperation {
    /// Create or replace the entity value
    Upsert(EntityValue),
    /// Remove the entity (its version survives as a tombstone)
    Delete,
    /// Add a signed amount to the current quantity
    Adjust { amount: f64 },
}

impl DeltaOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DeltaOperation::Upsert(_) => "upsert",
            DeltaOperation::Delete => "delete",
            DeltaOperation::Adjust { .. } => "adjust",
        }
    }
}

/// A change requested by a local operation, not yet versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: EntityKey,
    pub operation: DeltaOperation,
}

impl Mutation {
    pub fn new(key: EntityKey, operation: DeltaOperation) -> Self {
        Self { key, operation }
    }

    pub fn adjust(key: EntityKey, amount: f64) -> Self {
        Self::new(key, DeltaOperation::Adjust { amount })
    }

    pub fn upsert(key: EntityKey, value: EntityValue) -> Self {
        Self::new(key, DeltaOperation::Upsert(value))
    }

    pub fn delete(key: EntityKey) -> Self {
        Self::new(key, DeltaOperation::Delete)
    }

    /// Attach the version assigned by the commit path.
    pub fn commit(self, entity_version: u64) -> Delta {
        Delta {
            key: self.key,
            operation: self.operation,
            entity_version,
        }
    }
}

/// A committed, versioned change.
///
/// Only the master's commit path creates these; satellites apply them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub key: EntityKey,
    pub operation: DeltaOperation,
    pub entity_version: u64,
}

/// One entity as stored locally or exported in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// `None` marks a tombstone left by a delete
    pub value: Option<EntityValue>,
    pub version: u64,
}

impl EntityRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Full point-in-time copy of the synchronized state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<EntityRecord>,
    /// Highest entity version contained in `records`
    pub entity_version: u64,
}

impl Snapshot {
    pub fn new(mut records: Vec<EntityRecord>) -> Self {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let entity_version = records.iter().map(|r| r.version).max().unwrap_or(0);
        Self {
            records,
            entity_version,
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.iter().find(|r| &r.key == key)
    }

    /// Number of live (non-tombstone) entities.
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_tombstone()).count()
    }
}

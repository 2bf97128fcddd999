//! Sync Protocol Engine
//!
//! The rules both roles follow: handshake proofs, business validation of
//! operations, snapshot installation, and the ordering rule for deltas
//! (apply only `last_applied + 1`, drop duplicates, re-snapshot on gaps).
//!
//! Uses Sans-IO pattern: decisions are pure functions; the role handlers
//! perform the I/O they ask for.

use crate::domain::entities::{
    Delta, DeltaOperation, EntityKey, EntityRecord, EntityValue, Snapshot,
};
use crate::domain::ports::SyncStore;
use crate::replication::codec::{Handshake, PROTOCOL_VERSION};
use crate::replication::error::{AuthError, SyncError, ValidationError};
use crate::replication::types::{NodeIdentity, NodeRole};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type HmacSha256 = Hmac<Sha256>;

// ==================== Handshake ====================

fn proof_mac(
    secret: &[u8],
    node_id: &str,
    role: NodeRole,
    nonce: &[u8; 16],
) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidKey)?;
    mac.update(node_id.as_bytes());
    mac.update(&[0]);
    mac.update(role.as_str().as_bytes());
    mac.update(&[0]);
    mac.update(nonce);
    Ok(mac)
}

/// Compute the handshake proof for the given fields.
pub fn handshake_proof(
    secret: &[u8],
    node_id: &str,
    role: NodeRole,
    nonce: &[u8; 16],
) -> Result<Vec<u8>, AuthError> {
    Ok(proof_mac(secret, node_id, role, nonce)?
        .finalize()
        .into_bytes()
        .to_vec())
}

/// Build this node's handshake with a fresh random nonce.
pub fn build_handshake(
    identity: &NodeIdentity,
    role: NodeRole,
    display_name: &str,
) -> Result<Handshake, AuthError> {
    let nonce: [u8; 16] = rand::random();
    let proof = handshake_proof(identity.shared_secret(), identity.node_id.as_str(), role, &nonce)?;
    Ok(Handshake {
        protocol_version: PROTOCOL_VERSION,
        node_id: identity.node_id.0.clone(),
        role,
        display_name: display_name.to_string(),
        nonce,
        proof,
    })
}

/// Verify a peer's handshake against our shared secret.
pub fn verify_handshake(secret: &[u8], handshake: &Handshake) -> Result<(), AuthError> {
    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err(AuthError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: handshake.protocol_version,
        });
    }

    proof_mac(secret, &handshake.node_id, handshake.role, &handshake.nonce)?
        .verify_slice(&handshake.proof)
        .map_err(|_| AuthError::ProofMismatch)
}

/// Reason string sent back when a handshake is refused.
pub fn auth_failure_reason(err: &AuthError) -> &'static str {
    match err {
        AuthError::VersionMismatch { .. } => "version_mismatch",
        _ => "auth_failed",
    }
}

// ==================== Business rules ====================

fn check_quantity(key: &EntityKey, quantity: f64) -> Result<(), ValidationError> {
    if !quantity.is_finite() || quantity < 0.0 {
        return Err(ValidationError::InvalidQuantity(key.to_string()));
    }
    Ok(())
}

/// Compute the value an operation produces from the current value.
///
/// Returns `None` when the operation deletes the entity.
pub fn resolve_operation(
    key: &EntityKey,
    operation: &DeltaOperation,
    current: Option<&EntityValue>,
) -> Result<Option<EntityValue>, ValidationError> {
    match operation {
        DeltaOperation::Upsert(value) => {
            check_quantity(key, value.quantity)?;
            Ok(Some(value.clone()))
        }
        DeltaOperation::Delete => match current {
            Some(_) => Ok(None),
            None => Err(ValidationError::UnknownEntity(key.to_string())),
        },
        DeltaOperation::Adjust { amount } => {
            if !amount.is_finite() {
                return Err(ValidationError::InvalidQuantity(key.to_string()));
            }
            let current = current.ok_or_else(|| ValidationError::UnknownEntity(key.to_string()))?;
            let quantity = current.quantity + amount;
            if !quantity.is_finite() {
                return Err(ValidationError::InvalidQuantity(key.to_string()));
            }
            if quantity < 0.0 {
                return Err(ValidationError::InsufficientStock {
                    entity: key.to_string(),
                    available: current.quantity,
                    requested: -amount,
                });
            }
            Ok(Some(EntityValue {
                quantity,
                data: current.data.clone(),
            }))
        }
    }
}

// ==================== Delta ordering ====================

/// What to do with an incoming committed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaDecision {
    /// Version is exactly last_applied + 1
    Apply,
    /// Already applied; discard
    Duplicate,
    /// One or more versions were missed; fetch a fresh snapshot
    Gap { expected: u64 },
    /// A snapshot is in flight; it will supersede this delta
    AwaitSnapshot,
}

/// Classify an incoming version against the last applied one.
pub fn classify_delta(last_applied: u64, incoming: u64) -> DeltaDecision {
    let expected = last_applied + 1;
    if incoming == expected {
        DeltaDecision::Apply
    } else if incoming < expected {
        DeltaDecision::Duplicate
    } else {
        DeltaDecision::Gap { expected }
    }
}

/// Per-entity applied versions on a replica.
#[derive(Debug, Default)]
pub struct ReplicaState {
    versions: HashMap<EntityKey, u64>,
    awaiting_snapshot: bool,
    watermark: u64,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset versions to the snapshot's.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) {
        self.versions = snapshot
            .records
            .iter()
            .map(|r| (r.key.clone(), r.version))
            .collect();
        self.watermark = snapshot.entity_version;
        self.awaiting_snapshot = false;
    }

    pub fn last_applied(&self, key: &EntityKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Highest version applied for any entity.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Mark that a snapshot was requested; deltas are held off until it lands.
    pub fn request_snapshot(&mut self) {
        self.awaiting_snapshot = true;
    }

    pub fn classify(&self, delta: &Delta) -> DeltaDecision {
        if self.awaiting_snapshot {
            return DeltaDecision::AwaitSnapshot;
        }
        classify_delta(self.last_applied(&delta.key), delta.entity_version)
    }

    fn advance(&mut self, key: &EntityKey, version: u64) {
        self.versions.insert(key.clone(), version);
        self.watermark = self.watermark.max(version);
    }
}

/// Outcome of offering a delta to a replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Applied; carries the new value (`None` after a delete)
    Applied(Option<EntityValue>),
    /// Discarded without touching the store
    Skipped(DeltaDecision),
    /// The replica must request a fresh snapshot
    NeedsSnapshot,
}

/// Apply a committed delta to a replica store following the ordering rule.
pub async fn apply_delta(
    store: &dyn SyncStore,
    state: &mut ReplicaState,
    delta: &Delta,
) -> Result<ApplyOutcome, SyncError> {
    match state.classify(delta) {
        DeltaDecision::Apply => {}
        DeltaDecision::Gap { expected } => {
            tracing::info!(
                "version gap on {}: expected {}, got {}",
                delta.key,
                expected,
                delta.entity_version
            );
            state.request_snapshot();
            return Ok(ApplyOutcome::NeedsSnapshot);
        }
        decision => return Ok(ApplyOutcome::Skipped(decision)),
    }

    let current = store.get(&delta.key).await.map_err(SyncError::store)?;
    let current_value = current.as_ref().and_then(|r| r.value.as_ref());

    // The master validated this against identical state; failing here
    // means the replica diverged.
    let value = match resolve_operation(&delta.key, &delta.operation, current_value) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("replica diverged on {}: {}", delta.key, e);
            state.request_snapshot();
            return Ok(ApplyOutcome::NeedsSnapshot);
        }
    };

    store
        .write(EntityRecord {
            key: delta.key.clone(),
            value: value.clone(),
            version: delta.entity_version,
        })
        .await
        .map_err(SyncError::store)?;
    state.advance(&delta.key, delta.entity_version);

    Ok(ApplyOutcome::Applied(value))
}

/// Replace the replica store with a snapshot.
pub async fn install_snapshot(
    store: &dyn SyncStore,
    state: &mut ReplicaState,
    snapshot: &Snapshot,
) -> Result<(), SyncError> {
    store.replace_all(snapshot).await.map_err(SyncError::store)?;
    state.load_snapshot(snapshot);
    tracing::debug!(
        "installed snapshot with {} records at version {}",
        snapshot.records.len(),
        snapshot.entity_version
    );
    Ok(())
}

// ==================== Liveness ====================

/// Tracks when anything was last received on a link.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_received: Instant,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_received: Instant::now(),
            timeout,
        }
    }

    /// Record that an envelope arrived.
    pub fn touch(&mut self) {
        self.last_received = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_received) > self.timeout
    }

    /// When the link expires if nothing else arrives.
    pub fn deadline(&self) -> Instant {
        self.last_received + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemorySyncStore;
    use crate::domain::entities::Mutation;
    use crate::replication::types::NodeId;

    fn identity(license: &[u8]) -> NodeIdentity {
        NodeIdentity::new(NodeId::generate(), license)
    }

    #[test]
    fn test_handshake_verifies_with_same_license() {
        let satellite = identity(b"license");
        let master = identity(b"license");

        let hs = build_handshake(&satellite, NodeRole::Satellite, "caixa-2").unwrap();
        assert_eq!(hs.proof.len(), 32);
        assert!(verify_handshake(master.shared_secret(), &hs).is_ok());
    }

    #[test]
    fn test_handshake_rejected_with_other_license() {
        let satellite = identity(b"license-a");
        let master = identity(b"license-b");

        let hs = build_handshake(&satellite, NodeRole::Satellite, "caixa-2").unwrap();
        assert_eq!(
            verify_handshake(master.shared_secret(), &hs),
            Err(AuthError::ProofMismatch)
        );
    }

    #[test]
    fn test_handshake_tampered_role() {
        let node = identity(b"license");
        let mut hs = build_handshake(&node, NodeRole::Satellite, "x").unwrap();
        hs.role = NodeRole::Master;
        assert_eq!(
            verify_handshake(node.shared_secret(), &hs),
            Err(AuthError::ProofMismatch)
        );
    }

    #[test]
    fn test_handshake_version_mismatch() {
        let node = identity(b"license");
        let mut hs = build_handshake(&node, NodeRole::Satellite, "x").unwrap();
        hs.protocol_version = PROTOCOL_VERSION + 1;

        let err = verify_handshake(node.shared_secret(), &hs).unwrap_err();
        assert!(matches!(err, AuthError::VersionMismatch { .. }));
        assert_eq!(auth_failure_reason(&err), "version_mismatch");
        assert_eq!(auth_failure_reason(&AuthError::ProofMismatch), "auth_failed");
    }

    #[test]
    fn test_handshake_proof_accepts_any_key_length() {
        let nonce = [7u8; 16];
        for secret in [&[][..], &[1u8; 32][..], &[2u8; 200][..]] {
            let proof = handshake_proof(secret, "node", NodeRole::Master, &nonce).unwrap();
            assert_eq!(proof.len(), 32);
        }
        assert_ne!(
            handshake_proof(b"a", "node", NodeRole::Master, &nonce),
            handshake_proof(b"b", "node", NodeRole::Master, &nonce)
        );
    }

    #[test]
    fn test_nonces_differ() {
        let node = identity(b"license");
        let a = build_handshake(&node, NodeRole::Satellite, "x").unwrap();
        let b = build_handshake(&node, NodeRole::Satellite, "x").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.proof, b.proof);
    }

    #[test]
    fn test_resolve_adjust() {
        let key = EntityKey::stock("sku-1");
        let current = EntityValue::new(5.0);

        let value = resolve_operation(&key, &DeltaOperation::Adjust { amount: -1.0 }, Some(&current))
            .unwrap()
            .unwrap();
        assert_eq!(value.quantity, 4.0);
    }

    #[test]
    fn test_resolve_adjust_insufficient() {
        let key = EntityKey::stock("sku-2");
        let current = EntityValue::new(0.0);

        let err = resolve_operation(&key, &DeltaOperation::Adjust { amount: -1.0 }, Some(&current))
            .unwrap_err();
        assert_eq!(err.reason(), "insufficient_stock");
    }

    #[test]
    fn test_resolve_adjust_overflow_is_invalid() {
        let key = EntityKey::stock("sku-1");
        let current = EntityValue::new(f64::MAX);

        let err = resolve_operation(&key, &DeltaOperation::Adjust { amount: f64::MAX }, Some(&current))
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidQuantity(key.to_string()));
        assert_eq!(err.reason(), "invalid_quantity");
    }

    #[test]
    fn test_resolve_unknown_and_invalid() {
        let key = EntityKey::stock("missing");
        assert_eq!(
            resolve_operation(&key, &DeltaOperation::Adjust { amount: 1.0 }, None)
                .unwrap_err()
                .reason(),
            "unknown_entity"
        );
        assert_eq!(
            resolve_operation(&key, &DeltaOperation::Delete, None)
                .unwrap_err()
                .reason(),
            "unknown_entity"
        );
        assert_eq!(
            resolve_operation(&key, &DeltaOperation::Upsert(EntityValue::new(-2.0)), None)
                .unwrap_err()
                .reason(),
            "invalid_quantity"
        );
        assert_eq!(
            resolve_operation(
                &key,
                &DeltaOperation::Adjust { amount: f64::NAN },
                Some(&EntityValue::new(1.0))
            )
            .unwrap_err()
            .reason(),
            "invalid_quantity"
        );
    }

    #[test]
    fn test_resolve_delete_existing() {
        let key = EntityKey::stock("sku-1");
        let value = resolve_operation(&key, &DeltaOperation::Delete, Some(&EntityValue::new(1.0)));
        assert_eq!(value, Ok(None));
    }

    #[test]
    fn test_classify_delta() {
        assert_eq!(classify_delta(5, 6), DeltaDecision::Apply);
        assert_eq!(classify_delta(5, 5), DeltaDecision::Duplicate);
        assert_eq!(classify_delta(5, 2), DeltaDecision::Duplicate);
        assert_eq!(classify_delta(5, 8), DeltaDecision::Gap { expected: 6 });
        assert_eq!(classify_delta(0, 1), DeltaDecision::Apply);
    }

    fn record(id: &str, quantity: f64, version: u64) -> EntityRecord {
        EntityRecord {
            key: EntityKey::stock(id),
            value: Some(EntityValue::new(quantity)),
            version,
        }
    }

    #[tokio::test]
    async fn test_apply_in_order_then_duplicate() {
        let store = MemorySyncStore::new();
        let mut state = ReplicaState::new();
        install_snapshot(&store, &mut state, &Snapshot::new(vec![record("sku-1", 5.0, 5)]))
            .await
            .unwrap();

        let delta = Mutation::adjust(EntityKey::stock("sku-1"), -1.0).commit(6);
        let outcome = apply_delta(&store, &mut state, &delta).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(Some(EntityValue::new(4.0))));
        assert_eq!(state.last_applied(&EntityKey::stock("sku-1")), 6);

        let outcome = apply_delta(&store, &mut state, &delta).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(DeltaDecision::Duplicate));

        let stored = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert_eq!(stored.value.unwrap().quantity, 4.0);
    }

    #[tokio::test]
    async fn test_gap_requests_snapshot_and_holds_deltas() {
        let store = MemorySyncStore::new();
        let mut state = ReplicaState::new();
        install_snapshot(&store, &mut state, &Snapshot::new(vec![record("sku-1", 5.0, 5)]))
            .await
            .unwrap();

        // Version 6 was dropped.
        let delta7 = Mutation::adjust(EntityKey::stock("sku-1"), -1.0).commit(7);
        let outcome = apply_delta(&store, &mut state, &delta7).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::NeedsSnapshot);
        assert!(state.is_awaiting_snapshot());

        let delta8 = Mutation::adjust(EntityKey::stock("sku-1"), -1.0).commit(8);
        let outcome = apply_delta(&store, &mut state, &delta8).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(DeltaDecision::AwaitSnapshot));

        // Store untouched until the snapshot arrives.
        let stored = store.get(&EntityKey::stock("sku-1")).await.unwrap().unwrap();
        assert_eq!(stored.version, 5);

        install_snapshot(&store, &mut state, &Snapshot::new(vec![record("sku-1", 2.0, 8)]))
            .await
            .unwrap();
        assert!(!state.is_awaiting_snapshot());
        assert_eq!(state.last_applied(&EntityKey::stock("sku-1")), 8);
    }

    #[tokio::test]
    async fn test_divergent_replica_resnapshots() {
        let store = MemorySyncStore::new();
        let mut state = ReplicaState::new();
        install_snapshot(&store, &mut state, &Snapshot::new(vec![record("sku-1", 0.0, 1)]))
            .await
            .unwrap();

        let delta = Mutation::adjust(EntityKey::stock("sku-1"), -3.0).commit(2);
        let outcome = apply_delta(&store, &mut state, &delta).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::NeedsSnapshot);
    }

    #[tokio::test]
    async fn test_new_entity_starts_at_version_one() {
        let store = MemorySyncStore::new();
        let mut state = ReplicaState::new();

        let delta = Mutation::upsert(EntityKey::stock("new"), EntityValue::new(3.0)).commit(1);
        let outcome = apply_delta(&store, &mut state, &delta).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(Some(_))));
        assert_eq!(state.watermark(), 1);
    }

    #[test]
    fn test_liveness_expiry() {
        let mut liveness = Liveness::new(Duration::from_millis(50));
        let now = Instant::now();
        assert!(!liveness.is_expired(now));
        assert!(liveness.is_expired(now + Duration::from_millis(100)));

        liveness.touch();
        assert!(liveness.deadline() > now);
    }
}

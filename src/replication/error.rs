//! Sync Errors
//!
//! Error taxonomy of the sync core. Per-connection errors (`AuthError`,
//! `TransportError`, `ProtocolError`) stay inside the session that raised
//! them; `ConfigError` is returned to the caller; `ValidationError` is
//! reported back to the proposer only.

use crate::replication::config::ConfigError;
use crate::replication::types::NodeRole;
use std::net::SocketAddr;

/// Handshake failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("handshake proof mismatch")]
    ProofMismatch,
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u16, remote: u16 },
    #[error("peer rejected handshake: {0}")]
    RejectedByPeer(String),
    #[error("expected handshake, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("invalid handshake key")]
    InvalidKey,
}

/// Socket-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Business rule violations found while validating a proposal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("insufficient stock for {entity}: available {available}, requested {requested}")]
    InsufficientStock {
        entity: String,
        available: f64,
        requested: f64,
    },
    #[error("unknown entity {0}")]
    UnknownEntity(String),
    #[error("invalid quantity for {0}")]
    InvalidQuantity(String),
}

impl ValidationError {
    /// Machine-readable reason sent in `Error` envelopes.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InsufficientStock { .. } => "insufficient_stock",
            ValidationError::UnknownEntity(_) => "unknown_entity",
            ValidationError::InvalidQuantity(_) => "invalid_quantity",
        }
    }
}

/// Malformed or out-of-sequence traffic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("payload checksum mismatch")]
    Checksum,
    #[error("out of sequence: expected {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("snapshot not received in time")]
    SnapshotTimeout,
    #[error("no message within heartbeat timeout")]
    HeartbeatTimeout,
}

/// Any error raised by the sync core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn store(err: anyhow::Error) -> Self {
        SyncError::Store(format!("{:#}", err))
    }
}

/// Errors returned by `ConnectionManager::start`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartError {
    #[error("sync is already running")]
    AlreadyRunning,
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
}

/// Errors returned by `ConnectionManager::stop`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StopError {
    #[error("handler task failed: {0}")]
    JoinFailed(String),
}

/// Outcome of a local mutating operation that did not commit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProposalError {
    #[error("proposal rejected: {reason}")]
    Rejected { reason: String },
    #[error("not connected to a master")]
    NotConnected,
    #[error("no answer from master in time")]
    Timeout,
    #[error("sync is shutting down")]
    Shutdown,
    #[error("store error: {0}")]
    Store(String),
}

impl From<ValidationError> for ProposalError {
    fn from(err: ValidationError) -> Self {
        ProposalError::Rejected {
            reason: err.reason().to_string(),
        }
    }
}

/// Errors returned by the control-plane operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("sync is not running")]
    NotRunning,
    #[error("operation requires {expected} role, running as {actual}")]
    RoleMismatch { expected: NodeRole, actual: NodeRole },
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to persist config: {0}")]
    Persist(String),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_reasons() {
        let err = ValidationError::InsufficientStock {
            entity: "stock:sku-2".to_string(),
            available: 0.0,
            requested: 1.0,
        };
        assert_eq!(err.reason(), "insufficient_stock");
        assert_eq!(
            ValidationError::UnknownEntity("stock:x".into()).reason(),
            "unknown_entity"
        );
        assert_eq!(
            ValidationError::InvalidQuantity("stock:x".into()).reason(),
            "invalid_quantity"
        );
    }

    #[test]
    fn test_validation_into_proposal_error() {
        let err: ProposalError = ValidationError::UnknownEntity("stock:x".into()).into();
        assert_eq!(
            err,
            ProposalError::Rejected {
                reason: "unknown_entity".to_string()
            }
        );
    }

    #[test]
    fn test_sync_error_wraps_taxonomy() {
        let err: SyncError = ProtocolError::Checksum.into();
        assert_eq!(err.to_string(), "payload checksum mismatch");

        let err: SyncError = AuthError::ProofMismatch.into();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[test]
    fn test_role_mismatch_message() {
        let err = ManagerError::RoleMismatch {
            expected: NodeRole::Satellite,
            actual: NodeRole::Master,
        };
        assert_eq!(
            err.to_string(),
            "operation requires satellite role, running as master"
        );
    }
}

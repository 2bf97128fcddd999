//! Message Codec
//!
//! Wire messages exchanged between master and satellites, and the framing
//! used on the QUIC stream: `[u32 BE length][bincode(SyncEnvelope)]`.
//!
//! Uses Sans-IO pattern: everything here is pure encoding/decoding so the
//! protocol rules can be tested without sockets.

use crate::domain::entities::{Delta, Mutation, Snapshot};
use crate::replication::error::ProtocolError;
use crate::replication::types::NodeRole;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version of the sync wire protocol.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest frame accepted from a peer (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Kind tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Handshake,
    SnapshotRequest,
    SnapshotResponse,
    DeltaProposal,
    DeltaCommit,
    Heartbeat,
    Ack,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Handshake => "Handshake",
            EnvelopeKind::SnapshotRequest => "SnapshotRequest",
            EnvelopeKind::SnapshotResponse => "SnapshotResponse",
            EnvelopeKind::DeltaProposal => "DeltaProposal",
            EnvelopeKind::DeltaCommit => "DeltaCommit",
            EnvelopeKind::Heartbeat => "Heartbeat",
            EnvelopeKind::Ack => "Ack",
            EnvelopeKind::Error => "Error",
        }
    }
}

/// The unit of wire exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub kind: EnvelopeKind,
    /// Per-connection counter, starting at 1
    pub sequence: u64,
    /// Version assigned by the master, when the message carries one
    pub entity_version: Option<u64>,
    /// Kind-specific body, opaque outside this module
    pub payload: Vec<u8>,
    /// CRC32 of `payload`
    pub checksum: u32,
}

impl SyncEnvelope {
    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }
}

/// Handshake body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u16,
    pub node_id: String,
    pub role: NodeRole,
    pub display_name: String,
    pub nonce: [u8; 16],
    /// HMAC-SHA256 over node id, role and nonce
    pub proof: Vec<u8>,
}

/// A local mutation sent by a satellite for the master to validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: u64,
    pub mutation: Mutation,
}

/// Error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable reason, e.g. "auth_failed" or "insufficient_stock"
    pub reason: String,
    /// Set when the error answers a proposal
    pub proposal_id: Option<u64>,
    pub message: String,
}

impl ErrorBody {
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            message: reason.clone(),
            reason,
            proposal_id: None,
        }
    }

    pub fn for_proposal(mut self, proposal_id: u64) -> Self {
        self.proposal_id = Some(proposal_id);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Typed view of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Handshake(Handshake),
    SnapshotRequest,
    SnapshotResponse(Snapshot),
    DeltaProposal(Proposal),
    DeltaCommit(Delta),
    Heartbeat,
    Ack { proposal_id: u64, entity_version: u64 },
    Error(ErrorBody),
}

impl SyncMessage {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SyncMessage::Handshake(_) => EnvelopeKind::Handshake,
            SyncMessage::SnapshotRequest => EnvelopeKind::SnapshotRequest,
            SyncMessage::SnapshotResponse(_) => EnvelopeKind::SnapshotResponse,
            SyncMessage::DeltaProposal(_) => EnvelopeKind::DeltaProposal,
            SyncMessage::DeltaCommit(_) => EnvelopeKind::DeltaCommit,
            SyncMessage::Heartbeat => EnvelopeKind::Heartbeat,
            SyncMessage::Ack { .. } => EnvelopeKind::Ack,
            SyncMessage::Error(_) => EnvelopeKind::Error,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        SyncMessage::Error(ErrorBody::new(reason))
    }

    fn entity_version(&self) -> Option<u64> {
        match self {
            SyncMessage::SnapshotResponse(snapshot) => Some(snapshot.entity_version),
            SyncMessage::DeltaCommit(delta) => Some(delta.entity_version),
            SyncMessage::Ack { entity_version, .. } => Some(*entity_version),
            _ => None,
        }
    }

    /// Wrap into an envelope with the given connection sequence number.
    pub fn into_envelope(self, sequence: u64) -> Result<SyncEnvelope, ProtocolError> {
        let kind = self.kind();
        let entity_version = self.entity_version();
        let payload = match self {
            SyncMessage::Handshake(h) => encode_body(&h)?,
            SyncMessage::SnapshotResponse(s) => encode_body(&s)?,
            SyncMessage::DeltaProposal(p) => encode_body(&p)?,
            SyncMessage::DeltaCommit(d) => encode_body(&d)?,
            SyncMessage::Ack { proposal_id, .. } => encode_body(&proposal_id)?,
            SyncMessage::Error(e) => encode_body(&e)?,
            SyncMessage::SnapshotRequest | SyncMessage::Heartbeat => Vec::new(),
        };

        Ok(SyncEnvelope {
            kind,
            sequence,
            entity_version,
            checksum: crc32fast::hash(&payload),
            payload,
        })
    }

    /// Decode the typed message from an envelope, verifying its checksum.
    pub fn from_envelope(envelope: &SyncEnvelope) -> Result<Self, ProtocolError> {
        if !envelope.verify() {
            return Err(ProtocolError::Checksum);
        }

        let payload = &envelope.payload;
        let msg = match envelope.kind {
            EnvelopeKind::Handshake => SyncMessage::Handshake(decode_body(payload)?),
            EnvelopeKind::SnapshotRequest => SyncMessage::SnapshotRequest,
            EnvelopeKind::SnapshotResponse => SyncMessage::SnapshotResponse(decode_body(payload)?),
            EnvelopeKind::DeltaProposal => SyncMessage::DeltaProposal(decode_body(payload)?),
            EnvelopeKind::DeltaCommit => {
                let delta: Delta = decode_body(payload)?;
                if envelope.entity_version != Some(delta.entity_version) {
                    return Err(ProtocolError::Decode(
                        "commit version does not match envelope".to_string(),
                    ));
                }
                SyncMessage::DeltaCommit(delta)
            }
            EnvelopeKind::Heartbeat => SyncMessage::Heartbeat,
            EnvelopeKind::Ack => SyncMessage::Ack {
                proposal_id: decode_body(payload)?,
                entity_version: envelope
                    .entity_version
                    .ok_or_else(|| ProtocolError::Decode("ack without entity_version".to_string()))?,
            },
            EnvelopeKind::Error => SyncMessage::Error(decode_body(payload)?),
        };
        Ok(msg)
    }
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Encode an envelope as a length-prefixed frame (Sans-IO pattern).
pub fn encode_frame(envelope: &SyncEnvelope) -> Result<Bytes, ProtocolError> {
    let data = encode_body(envelope)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Decode(format!(
            "frame too large: {} bytes",
            data.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(&data);
    Ok(buf.freeze())
}

/// Decode a frame length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode an envelope from a frame body (Sans-IO pattern).
pub fn decode_envelope(data: &[u8]) -> Result<SyncEnvelope, ProtocolError> {
    decode_body(data)
}

/// Outgoing sequence numbers for one connection.
#[derive(Debug, Default)]
pub struct OutboundSequence {
    last: u64,
}

impl OutboundSequence {
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

/// Checks that incoming envelopes arrive in order without loss.
#[derive(Debug, Default)]
pub struct InboundSequence {
    last: u64,
}

impl InboundSequence {
    pub fn check(&mut self, sequence: u64) -> Result<(), ProtocolError> {
        let expected = self.last + 1;
        if sequence != expected {
            return Err(ProtocolError::OutOfSequence {
                expected,
                got: sequence,
            });
        }
        self.last = sequence;
        Ok(())
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

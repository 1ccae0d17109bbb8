//! Protocol messages exchanged with the backend.

use crate::codec::{self, RawMessage, WireFormat};
use crate::correlation::CorrelationId;
use crate::envelope::Envelope;
use crate::error::ProtocolResult;
use crate::kind::EntityKind;
use crate::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Declares the kinds the client wants pushed.
    Subscribe(SubscribeRequest),
    /// Asks for every change of a kind newer than a revision.
    Resync(ResyncRequest),
    /// A locally initiated mutation.
    Mutation(MutationRequest),
    /// Keepalive probe.
    Ping {
        /// Echoed back in the matching `Pong`.
        nonce: u64,
    },
}

impl ClientFrame {
    /// Encodes this frame in the given wire format.
    pub fn encode(&self, format: WireFormat) -> ProtocolResult<RawMessage> {
        codec::encode(self, format)
    }

    /// Decodes a frame from a raw message.
    pub fn decode(raw: &RawMessage) -> ProtocolResult<Self> {
        codec::decode(raw)
    }
}

/// A frame sent from the backend to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A single entity change.
    Event(Envelope),
    /// Answer to a `Resync` request.
    ResyncBatch(ResyncBatch),
    /// A mutation the backend refused.
    MutationRejected(MutationRejected),
    /// Keepalive answer.
    Pong {
        /// Nonce from the matching `Ping`.
        nonce: u64,
    },
    /// Backend-side error not tied to a mutation.
    Error {
        /// Human-readable message.
        message: String,
    },
}

impl ServerFrame {
    /// Encodes this frame in the given wire format.
    pub fn encode(&self, format: WireFormat) -> ProtocolResult<RawMessage> {
        codec::encode(self, format)
    }

    /// Decodes a frame from a raw message.
    pub fn decode(raw: &RawMessage) -> ProtocolResult<Self> {
        codec::decode(raw)
    }
}

/// Subscription handshake sent after every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Kinds to push.
    pub kinds: Vec<EntityKind>,
    /// Client protocol version.
    pub protocol_version: u16,
}

impl SubscribeRequest {
    /// Creates a subscribe request for the current protocol version.
    pub fn new(kinds: Vec<EntityKind>) -> Self {
        Self {
            kinds,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Catch-up request for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// Kind to resync.
    pub kind: EntityKind,
    /// Only changes with a revision greater than this are returned.
    /// Zero requests the complete current set.
    pub since_revision: u64,
}

impl ResyncRequest {
    /// Creates a resync request.
    pub fn new(kind: EntityKind, since_revision: u64) -> Self {
        Self {
            kind,
            since_revision,
        }
    }
}

/// Resync answer: every change of `kind` newer than `since_revision`,
/// ordered by revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncBatch {
    /// Kind of every envelope in the batch.
    pub kind: EntityKind,
    /// Revision the batch starts after.
    pub since_revision: u64,
    /// Changes, in revision order. Deletes appear as delete envelopes.
    pub envelopes: Vec<Envelope>,
}

impl ResyncBatch {
    /// Creates a resync batch.
    pub fn new(kind: EntityKind, since_revision: u64, envelopes: Vec<Envelope>) -> Self {
        Self {
            kind,
            since_revision,
            envelopes,
        }
    }

    /// A batch from revision zero carries the complete set for the kind;
    /// entities absent from it no longer exist.
    pub fn is_full(&self) -> bool {
        self.since_revision == 0
    }

    /// Highest revision in the batch, or `since_revision` when empty.
    pub fn high_water(&self) -> u64 {
        self.envelopes
            .iter()
            .map(|e| e.revision)
            .max()
            .unwrap_or(self.since_revision)
    }
}

/// A mutation request sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Action name understood by the backend (`scale`, `restart`, `delete`, ...).
    pub action_type: String,
    /// Kind of the target entity.
    pub kind: EntityKind,
    /// Target entity id.
    pub entity_id: String,
    /// Action arguments.
    #[serde(default)]
    pub payload: Value,
    /// Client-generated correlation id.
    pub correlation_id: CorrelationId,
}

/// Backend refusal of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRejected {
    /// Correlation id of the refused mutation.
    pub correlation_id: CorrelationId,
    /// Why it was refused.
    pub reason: String,
}

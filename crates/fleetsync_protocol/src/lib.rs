//! # fleetsync Protocol
//!
//! Wire protocol types and codecs for the fleetsync state-sync engine.
//!
//! This crate provides:
//! - `Envelope` for entity change records pushed by the backend
//! - `ClientFrame` / `ServerFrame` protocol messages
//! - `CorrelationId` for tying optimistic mutations to confirmations
//! - CBOR (binary frames) and JSON (text frames) encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Framing
//!
//! Every frame is an internally tagged map (`"type": "event"`, ...). Binary
//! transports (gRPC-Web, WebSocket binary) carry CBOR; text transports
//! (WebSocket text, SSE `data:` lines) carry JSON. Both decode to the same
//! types.
//!
//! ```
//! use fleetsync_protocol::{Envelope, EntityKind, EntityStatus, ServerFrame, WireFormat};
//!
//! let frame = ServerFrame::Event(Envelope::upsert(
//!     EntityKind::Deployment,
//!     "deployment-42",
//!     3,
//!     EntityStatus::Healthy,
//!     serde_json::json!({ "replicas": 3 }),
//! ));
//! let raw = frame.encode(WireFormat::Binary).unwrap();
//! assert_eq!(ServerFrame::decode(&raw).unwrap(), frame);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod correlation;
mod envelope;
mod error;
mod kind;
mod messages;

pub use codec::{RawMessage, WireFormat};
pub use correlation::CorrelationId;
pub use envelope::{Envelope, Operation};
pub use error::{ProtocolError, ProtocolResult};
pub use kind::{EntityKind, EntityStatus};
pub use messages::{
    ClientFrame, MutationRejected, MutationRequest, ResyncBatch, ResyncRequest, ServerFrame,
    SubscribeRequest,
};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

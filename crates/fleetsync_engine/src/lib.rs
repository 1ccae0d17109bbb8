//! # fleetsync Engine
//!
//! Real-time state synchronization for fleetsync dashboards.
//!
//! This crate provides:
//! - A transport channel abstraction with in-memory and WebSocket connectors
//! - A reconnect supervisor with exponential backoff, jitter and heartbeats
//! - An event decoder that drops malformed frames without halting the stream
//! - A revision-ordered entity store with atomic resync
//! - An optimistic update ledger with confirmation, rejection and timeout
//! - A subscription router with per-kind, in-order delivery
//!
//! ## Architecture
//!
//! The backend is authoritative. It pushes change envelopes tagged with a
//! per-kind revision; the client keeps the newest revision of every entity
//! and ignores anything older. After every (re)connect the engine asks for
//! all changes since the last revision up to which it holds every change,
//! so a client that drops and reconnects converges to the same state as one
//! that never disconnected.
//!
//! Local mutations are shown immediately as predictions layered over the
//! confirmed state. A prediction disappears when a backend event confirms
//! it, when the backend rejects it, or when it times out; only the caller
//! that issued the mutation learns which.
//!
//! ## Key Invariants
//!
//! - Per entity, applied revisions strictly increase
//! - A resync batch is applied atomically and notified once
//! - Every optimistic entry is resolved exactly once
//! - Subscribers of a kind see its changes in application order
//! - No transport or decode error terminates the engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod decoder;
mod engine;
mod error;
mod ledger;
mod router;
mod store;
mod supervisor;
mod transport;
#[cfg(feature = "websocket")]
mod websocket;

pub use config::{BackoffConfig, Credentials, EngineConfig, HeartbeatConfig, TokenProvider};
pub use decoder::EventDecoder;
pub use engine::{ConnectionStats, EngineHandle, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use ledger::{
    ExpiryReason, Mutation, MutationOutcome, MutationTicket, OptimisticEntry, OptimisticLedger,
    Prediction, Resolution, ResolutionKind,
};
pub use router::{
    Callback, ChangeCause, ChangeSet, ConnectionEvent, Notification, SubscriptionHandle,
    SubscriptionRouter,
};
pub use store::{
    ApplyOutcome, Entity, EntityTable, EntityView, ResyncOutcome, Snapshot, StateStore,
    StoreStats,
};
pub use supervisor::{
    ConnectionState, HeartbeatAction, HeartbeatMonitor, ReconnectSupervisor, RetryPlan,
};
pub use transport::{
    Channel, ChannelPeer, Connector, MemoryConnection, MemoryConnector, MemoryListener,
    PeerReceiver, PeerSender,
};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

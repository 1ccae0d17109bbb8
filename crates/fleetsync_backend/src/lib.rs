//! # fleetsync Backend
//!
//! In-memory reference backend for the fleetsync protocol.
//!
//! This crate provides:
//! - An authoritative entity journal with per-kind revisions
//! - Resync handling (full set from revision zero, deltas otherwise)
//! - Mutation handling with optional correlation echo and rejections
//! - A change feed pushed to subscribed sessions
//!
//! The backend does no I/O of its own. Transports hand raw messages to a
//! [`BackendSession`] and forward whatever it returns; the engine's
//! integration tests and the `fleetsync serve` demo both work this way.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod journal;
mod server;

pub use config::BackendConfig;
pub use error::{BackendError, BackendResult};
pub use handler::{BackendStats, HandlerContext, MutationResult};
pub use journal::EntityJournal;
pub use server::{BackendServer, BackendSession};

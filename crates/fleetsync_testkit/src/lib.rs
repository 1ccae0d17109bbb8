//! # fleetsync Testkit
//!
//! Test utilities for fleetsync.
//!
//! This crate provides:
//! - Envelope and mutation fixtures
//! - A reference model of the state a client must converge to
//! - Property-based generators for histories and adversarial deliveries
//! - A harness serving in-memory engine connections from the reference
//!   backend
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleetsync_testkit::prelude::*;
//!
//! let (connector, listener) = MemoryConnector::new();
//! let backend = TestBackend::spawn(BackendServer::default(), listener);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use fleetsync_backend::{BackendConfig, BackendServer};
    pub use fleetsync_engine::MemoryConnector;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;

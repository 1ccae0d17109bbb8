//! CLI command implementations.

pub mod backoff;
pub mod replay;
pub mod serve;
pub mod watch;

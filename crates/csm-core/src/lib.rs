//! csm Core - Shared types for CLI session monitoring
//!
//! This crate provides the domain types and the pure session state machine
//! shared between the engine (`csmd`) and the `csm` front end.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod attention;
pub mod error;
pub mod reconcile;
pub mod session;

// Re-exports for convenience
pub use attention::AttentionSignal;
pub use error::{DomainError, DomainResult};
pub use reconcile::{
    reconcile, Reconciliation, Thresholds, DEFAULT_IDLE_THRESHOLD, DEFAULT_RUNNING_THRESHOLD,
};
pub use session::{ProcessRecord, Session, SessionCounts, SessionMap, SessionState};

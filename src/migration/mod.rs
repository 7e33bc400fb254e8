//! Dynamic execution-state migration: atomically relocates live execution
//! pointers inside a running instance's tree while reproducing every
//! structural invariant the step interpreter would have produced.

pub mod mutator;
pub mod planner;
pub mod request;
pub mod resolver;

pub use request::ChangeStateRequest;

use thiserror::Error;

/// Errors surfaced synchronously from `change_state()`. Nothing is ever
/// swallowed or retried internally; the instance is untouched unless the
/// whole request committed.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The request references state that does not exist: unknown activity,
    /// activity absent from a pinned definition version, an unoccupied
    /// cancellation source, or an iteration execution trying to escape its
    /// multi-instance boundary.
    #[error("structural error: {0}")]
    Structural(String),

    /// The target instance is locked by another operation. The caller may
    /// retry the whole request.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Internal planner/mutator inconsistency. The transaction was rolled
    /// back; nothing was applied.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

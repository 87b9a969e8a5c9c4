//! The store's status taxonomy.

use thiserror::Error;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced at the store API boundary.
///
/// Recoverable conditions (sector corruption, partial writes, replica
/// loss) are absorbed inside the engine where possible: the offending
/// sector is latched corrupt, the error flag is set, and the operation
/// may still succeed. What reaches the caller is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Caller-supplied key or value has an unacceptable shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The store's state forbids the operation (not initialized, or
    /// writes attempted while maintenance is needed).
    #[error("operation not permitted in current store state")]
    FailedPrecondition,
    /// No such key (or, from `garbage_collect`, nothing to reclaim).
    #[error("not found")]
    NotFound,
    /// No flash space or entry-cache slot available, even after GC.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Bytes read from flash failed validation, or the partition failed.
    #[error("data loss")]
    DataLoss,
    /// Accounting invariant violated; should not occur.
    #[error("internal error")]
    Internal,
    /// Unexpected partition or codec error during initialization.
    #[error("unknown error")]
    Unknown,
}

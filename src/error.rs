//! Error kinds for the storage engine.
//!
//! Every fallible operation in this crate returns [`Result<T>`], where the
//! error side is a single [`StorageError`] enum. No operation relies on
//! string matching; callers match on the variant.

use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The distinct failure kinds a storage operation can report.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A required input was absent (e.g. a `None` where a value was needed).
    #[error("required argument '{0}' was null")]
    ArgumentNull(&'static str),

    /// A numeric input violated its domain (negative index, zero capacity...).
    #[error("argument '{name}' out of range: {detail}")]
    ArgumentOutOfRange {
        name: &'static str,
        detail: String,
    },

    /// A structural precondition failed: page too small, wrong buffer size,
    /// read-only/fixed-capacity mismatch, and similar.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A method was called in an illegal state: writing while read-only,
    /// mutating during enumeration, validating while writable.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// `UpdateValue` (or similar) targeted a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// Allocation or inflation was refused by the backing medium.
    #[error("not enough space: {0}")]
    NotEnoughSpace(String),

    /// `Validate` detected an on-disk invariant violation.
    #[error("corrupt storage: {0}")]
    Corrupt(String),

    /// A cancellable operation was aborted before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The byte medium itself failed.
    #[error("medium I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn out_of_range(name: &'static str, detail: impl fmt::Display) -> Self {
        StorageError::ArgumentOutOfRange {
            name,
            detail: detail.to_string(),
        }
    }

    pub fn argument(detail: impl fmt::Display) -> Self {
        StorageError::Argument(detail.to_string())
    }

    pub fn invalid_operation(detail: impl fmt::Display) -> Self {
        StorageError::InvalidOperation(detail.to_string())
    }

    pub fn not_enough_space(detail: impl fmt::Display) -> Self {
        StorageError::NotEnoughSpace(detail.to_string())
    }

    pub fn corrupt(detail: impl fmt::Display) -> Self {
        StorageError::Corrupt(detail.to_string())
    }

    /// True for [`StorageError::Cancelled`]; lets call sites branch on
    /// cancellation without a full match.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

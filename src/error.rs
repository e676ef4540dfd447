use ledgerstore_core::{CodecError, RecordKind, StorageError};
use thiserror::Error;

use crate::checker::Violation;

/// Errors surfaced by [`LedgerStore`](crate::LedgerStore) operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The request broke a ledger rule. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(Violation),
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(StorageError),
    /// Persisted state breaks an invariant. Never repaired automatically.
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("cancelled after {processed} records")]
    Cancelled { processed: usize },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        LedgerError::NotFound { kind, id: id.into() }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, LedgerError::Validation(_))
    }
}

impl From<Violation> for LedgerError {
    fn from(v: Violation) -> Self {
        LedgerError::Validation(v)
    }
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Corruption(reason) => LedgerError::Corruption(reason),
            StorageError::Conflict(reason) => LedgerError::Conflict(reason),
            other => LedgerError::Backend(other),
        }
    }
}

/// A record the store wrote itself failed to decode.
impl From<CodecError> for LedgerError {
    fn from(e: CodecError) -> Self {
        LedgerError::Corruption(e.to_string())
    }
}

//! Core types and traits for LedgerStore storage backends.
//!
//! This crate provides the ledger data model, the record codec that maps
//! entities onto JSON documents, and the `BackendDriver` trait, enabling
//! pluggable storage implementations in separate crates.

pub mod cancel;
pub mod codec;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use cancel::CancellationToken;
pub use codec::{CodecError, Document};
pub use models::{checked_sum, is_currency_code, Account, AccountKind, Line, Transaction};
pub use storage::{BackendDriver, RawRecord, ReconcileReport, RecordKind, StorageError, StorageResult};

/// Generates a fresh record identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

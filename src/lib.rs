//! LedgerStore: a double-entry ledger whose invariants hold identically on
//! every storage backend.
//!
//! [`LedgerStore`] validates each mutation with the [`checker`] rules and
//! hands the encoded records to a [`BackendDriver`]. Drivers live in their
//! own crates and make multi-record commits atomic in whatever way their
//! medium allows.

pub mod backend;
pub mod checker;
pub mod config;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod store;

pub use checker::{AuditReport, ConsistencyChecker, Violation};
pub use error::{LedgerError, LedgerResult};
pub use ledgerstore_core::{
    Account, AccountKind, BackendDriver, CancellationToken, Line, ReconcileReport, RecordKind, Transaction,
};
pub use reconcile::ReconciliationWorker;
pub use store::{BackfillReport, LedgerOptions, LedgerStore, TransactionDraft, Transactions};

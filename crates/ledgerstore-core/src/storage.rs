use std::{fmt::Display, time::Duration};

use thiserror::Error;

use crate::{cancel::CancellationToken, codec::Document};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
    #[error("invalid record key: {0}")]
    InvalidKey(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("commit conflict: {0}")]
    Conflict(String),
    #[error("unsupported by this backend: {0}")]
    Unsupported(String),
    #[error("corrupt storage: {0}")]
    Corruption(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Account,
    Transaction,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Account, RecordKind::Transaction];

    /// Directory / collection name for this kind of record.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Account => "accounts",
            RecordKind::Transaction => "transactions",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        match name {
            "accounts" => Some(RecordKind::Account),
            "transactions" => Some(RecordKind::Transaction),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Account => f.write_str("account"),
            RecordKind::Transaction => f.write_str("transaction"),
        }
    }
}

/// A serialized record as handed to and returned by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub id: String,
    pub body: Document,
}

impl RawRecord {
    pub fn new(kind: RecordKind, id: impl Into<String>, body: Document) -> Self {
        Self {
            kind,
            id: id.into(),
            body,
        }
    }
}

/// Outcome of a reconciliation pass over interrupted commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Commits found fully applied and finalized.
    pub completed: usize,
    /// Commits found with nothing applied and dropped.
    pub discarded: usize,
    /// Commits found partially applied and restored to their pre-images.
    pub rolled_back: usize,
    /// Commits that could not be classified; left in place for an operator.
    pub unresolved: Vec<String>,
    /// False when the pass was cancelled before visiting every commit.
    pub finished: bool,
}

impl ReconcileReport {
    pub fn resolved(&self) -> usize {
        self.completed + self.discarded + self.rolled_back
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.completed += other.completed;
        self.discarded += other.discarded;
        self.rolled_back += other.rolled_back;
        self.unresolved.extend(other.unresolved);
        self.finished = other.finished;
    }
}

/// Raw key-addressed persistence for ledger records.
///
/// Drivers own only serialized bytes; they never judge whether a write is
/// semantically valid. Every write they receive has already been validated.
/// Reads only ever expose committed records: anything belonging to a commit
/// still in flight is invisible until the commit completes.
pub trait BackendDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self, kind: RecordKind, id: &str) -> StorageResult<Option<Document>>;

    /// True if the id is taken, including by a record of an unfinished commit.
    fn exists(&self, kind: RecordKind, id: &str) -> StorageResult<bool>;

    fn scan(&self, kind: RecordKind) -> StorageResult<Vec<RawRecord>>;

    /// Writes a single record atomically.
    fn write(&self, record: &RawRecord) -> StorageResult<()>;

    /// Writes several records so that readers see all of them or none.
    /// Every non-transaction record must carry a `revision` field.
    fn atomic_multi_write(&self, records: &[RawRecord]) -> StorageResult<()>;

    /// Resolves commits interrupted longer than `older_than` ago.
    fn reconcile(&self, older_than: Duration, cancel: &CancellationToken) -> StorageResult<ReconcileReport>;
}

/// Rejects ids that cannot safely address a file or document.
pub fn validate_key(id: &str) -> StorageResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(StorageError::InvalidKey(id.to_string()));
    }
    Ok(())
}

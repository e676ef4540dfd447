//! Two-phase commit over a store with per-document atomicity.
//!
//! A batch is anchored on its transaction document:
//!
//! 1. the transaction is inserted with `status = "pending"`, together with
//!    the before and after image of every other document in the batch;
//! 2. each of those documents is written;
//! 3. the transaction is rewritten with `status = "committed"`.
//!
//! Readers never see pending transactions. A pending anchor left behind by
//! a crash is resolved by [`reconcile`](BackendDriver::reconcile) once it is
//! older than the grace period: if every update landed the commit is
//! completed, otherwise whatever landed is restored and the anchor dropped.
//! Whether an update landed is decided by the `revision` it carries.
//!
//! Every account write must carry the revision right after the stored one.
//! Resolving a stale claim can roll a document back underneath a caller
//! that read it earlier; the revision check turns that into a conflict
//! instead of persisting an image built from the rolled-back state.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use ledgerstore_core::{
    codec::{format_timestamp, parse_timestamp, REVISION_FIELD},
    storage::validate_key,
    BackendDriver, CancellationToken, Document, RawRecord, ReconcileReport, RecordKind, StorageError,
    StorageResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::store::DocumentStore;

pub const STATUS_FIELD: &str = "status";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMMITTED: &str = "committed";
const PENDING_SINCE_FIELD: &str = "pending_since";
const PENDING_WRITES_FIELD: &str = "pending_writes";

const TRANSACTIONS: &str = "transactions";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingWrite {
    collection: String,
    id: String,
    revision: u64,
    before: Option<Document>,
    after: Document,
}

#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    Completed,
    Discarded,
    RolledBack,
}

pub struct DocumentStoreDriver {
    store: Arc<dyn DocumentStore>,
    grace_period: Duration,
    writer: Mutex<()>,
    visibility: RwLock<()>,
}

impl DocumentStoreDriver {
    /// `grace_period` bounds how long another writer's pending commit is
    /// respected before a conflicting write reconciles it.
    pub fn new(store: Arc<dyn DocumentStore>, grace_period: Duration) -> Self {
        Self {
            store,
            grace_period,
            writer: Mutex::new(()),
            visibility: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn put_committed(&self, id: &str, body: &Document) -> StorageResult<()> {
        let mut doc = strip_driver_fields(body.clone());
        set_field(&mut doc, STATUS_FIELD, Value::String(STATUS_COMMITTED.to_string()))?;
        self.store.put(TRANSACTIONS, id, &doc)
    }

    fn restore(&self, writes: &[PendingWrite]) -> StorageResult<()> {
        for w in writes.iter().rev() {
            match &w.before {
                Some(doc) => self.store.put(&w.collection, &w.id, doc)?,
                None => {
                    self.store.delete(&w.collection, &w.id)?;
                }
            }
        }
        Ok(())
    }

    /// Undoes an in-call failure. Anything that cannot be undone stays
    /// pending for reconciliation.
    fn abort(&self, anchor_id: &str, applied: &[PendingWrite]) {
        let undone = self
            .restore(applied)
            .and_then(|_| self.store.delete(TRANSACTIONS, anchor_id).map(|_| ()));
        match undone {
            Ok(()) => tracing::warn!(anchor = anchor_id, "Commit aborted and rolled back"),
            Err(e) => tracing::error!(
                anchor = anchor_id,
                error = %e,
                "Rollback failed, commit left pending for reconciliation"
            ),
        }
    }

    fn resolve_anchor(&self, anchor_id: &str, anchor: &Document) -> StorageResult<Resolution> {
        let writes: Vec<PendingWrite> = anchor
            .get(PENDING_WRITES_FIELD)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StorageError::Corruption(format!("anchor {}: {}", anchor_id, e)))?
            .unwrap_or_default();

        let mut applied = Vec::new();
        let mut missing = 0usize;
        for w in &writes {
            let current = self.store.get(&w.collection, &w.id)?;
            let current_rev = current.as_ref().and_then(revision_of);
            let before_rev = w.before.as_ref().and_then(revision_of);
            match current_rev {
                Some(rev) if rev >= w.revision => applied.push(w.clone()),
                rev if rev == before_rev => missing += 1,
                _ => {
                    return Err(StorageError::Corruption(format!(
                        "{}/{} revision {:?} fits neither side of commit {}",
                        w.collection, w.id, current_rev, anchor_id
                    )))
                }
            }
        }

        if missing == 0 {
            self.put_committed(anchor_id, anchor)?;
            Ok(Resolution::Completed)
        } else if applied.is_empty() {
            self.store.delete(TRANSACTIONS, anchor_id)?;
            Ok(Resolution::Discarded)
        } else {
            self.restore(&applied)?;
            self.store.delete(TRANSACTIONS, anchor_id)?;
            Ok(Resolution::RolledBack)
        }
    }

    fn check_revision(&self, collection: &str, id: &str, revision: u64, current: Option<&Document>) -> StorageResult<()> {
        let stored = match current {
            Some(doc) => revision_of(doc),
            None => Some(0),
        };
        if stored != revision.checked_sub(1) {
            return Err(StorageError::Conflict(format!(
                "{}/{} is at revision {:?}, write expects {}",
                collection,
                id,
                stored,
                revision.saturating_sub(1)
            )));
        }
        Ok(())
    }

    /// Makes sure no pending commit still claims any of `targets`.
    fn clear_pending_claims(&self, targets: &HashSet<(String, String)>) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        for (anchor_id, anchor) in self.store.find_eq(TRANSACTIONS, STATUS_FIELD, STATUS_PENDING)? {
            let claims = pending_targets(&anchor);
            if claims.is_disjoint(targets) {
                continue;
            }
            if pending_age(&anchor, now).map_or(true, |age| age < self.grace_period) {
                return Err(StorageError::Conflict(format!(
                    "records are claimed by pending transaction {}",
                    anchor_id
                )));
            }
            let resolution = self.resolve_anchor(&anchor_id, &anchor)?;
            tracing::info!(anchor = %anchor_id, ?resolution, "Resolved stale pending transaction before commit");
        }
        Ok(())
    }
}

impl BackendDriver for DocumentStoreDriver {
    fn name(&self) -> &'static str {
        "document_store"
    }

    fn read(&self, kind: RecordKind, id: &str) -> StorageResult<Option<Document>> {
        validate_key(id)?;
        let _visible = self.visibility.read().unwrap();
        let doc = self.store.get(kind.collection(), id)?;
        Ok(doc.and_then(|d| visible(kind, d)))
    }

    fn exists(&self, kind: RecordKind, id: &str) -> StorageResult<bool> {
        validate_key(id)?;
        Ok(self.store.get(kind.collection(), id)?.is_some())
    }

    fn scan(&self, kind: RecordKind) -> StorageResult<Vec<RawRecord>> {
        let _visible = self.visibility.read().unwrap();
        Ok(self
            .store
            .find_all(kind.collection())?
            .into_iter()
            .filter_map(|(id, doc)| visible(kind, doc).map(|body| RawRecord::new(kind, id, body)))
            .collect())
    }

    fn write(&self, record: &RawRecord) -> StorageResult<()> {
        validate_key(&record.id)?;
        let _writer = self.writer.lock().unwrap();
        let _visible = self.visibility.write().unwrap();
        let target = (record.kind.collection().to_string(), record.id.clone());
        self.clear_pending_claims(&HashSet::from([target]))?;
        match record.kind {
            RecordKind::Transaction => self.put_committed(&record.id, &record.body),
            RecordKind::Account => {
                let collection = record.kind.collection();
                if let Some(revision) = revision_of(&record.body) {
                    let current = self.store.get(collection, &record.id)?;
                    self.check_revision(collection, &record.id, revision, current.as_ref())?;
                }
                self.store.put(collection, &record.id, &record.body)
            }
        }
    }

    fn atomic_multi_write(&self, records: &[RawRecord]) -> StorageResult<()> {
        if records.len() == 1 {
            return self.write(&records[0]);
        }
        for rec in records {
            validate_key(&rec.id)?;
        }
        let mut anchors = records.iter().filter(|r| r.kind == RecordKind::Transaction);
        let anchor = match (anchors.next(), anchors.next()) {
            (Some(anchor), None) => anchor,
            _ => {
                return Err(StorageError::Unsupported(
                    "a multi-document commit needs exactly one transaction document".to_string(),
                ))
            }
        };

        let _writer = self.writer.lock().unwrap();

        let targets: HashSet<(String, String)> = records
            .iter()
            .map(|r| (r.kind.collection().to_string(), r.id.clone()))
            .collect();
        // Resolving a stale claim rewrites documents, so readers wait from here.
        let _visible = self.visibility.write().unwrap();
        self.clear_pending_claims(&targets)?;

        let mut writes = Vec::with_capacity(records.len() - 1);
        for rec in records.iter().filter(|r| r.kind != RecordKind::Transaction) {
            let revision = revision_of(&rec.body).ok_or_else(|| {
                StorageError::Unsupported(format!("{} {} has no revision", rec.kind, rec.id))
            })?;
            let collection = rec.kind.collection();
            let before = self.store.get(collection, &rec.id)?;
            self.check_revision(collection, &rec.id, revision, before.as_ref())?;
            writes.push(PendingWrite {
                collection: collection.to_string(),
                id: rec.id.clone(),
                revision,
                before,
                after: rec.body.clone(),
            });
        }

        let mut pending = strip_driver_fields(anchor.body.clone());
        set_field(&mut pending, STATUS_FIELD, Value::String(STATUS_PENDING.to_string()))?;
        set_field(
            &mut pending,
            PENDING_SINCE_FIELD,
            Value::String(
                format_timestamp(OffsetDateTime::now_utc()).map_err(|e| StorageError::Other(e.to_string()))?,
            ),
        )?;
        set_field(&mut pending, PENDING_WRITES_FIELD, serde_json::to_value(&writes)?)?;

        self.store.insert(TRANSACTIONS, &anchor.id, &pending)?;

        for (applied, w) in writes.iter().enumerate() {
            if let Err(e) = self.store.put(&w.collection, &w.id, &w.after) {
                self.abort(&anchor.id, &writes[..applied]);
                return Err(e);
            }
        }

        if let Err(e) = self.put_committed(&anchor.id, &anchor.body) {
            self.abort(&anchor.id, &writes);
            return Err(e);
        }

        tracing::debug!(anchor = %anchor.id, documents = records.len(), "Commit applied");
        Ok(())
    }

    fn reconcile(&self, older_than: Duration, cancel: &CancellationToken) -> StorageResult<ReconcileReport> {
        let _writer = self.writer.lock().unwrap();
        let _visible = self.visibility.write().unwrap();
        let now = OffsetDateTime::now_utc();

        let mut report = ReconcileReport::default();
        for (anchor_id, anchor) in self.store.find_eq(TRANSACTIONS, STATUS_FIELD, STATUS_PENDING)? {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            match pending_age(&anchor, now) {
                Some(age) if age < older_than => continue,
                Some(_) => {}
                None => {
                    tracing::error!(anchor = %anchor_id, "Pending transaction has no valid pending_since");
                    report.unresolved.push(anchor_id);
                    continue;
                }
            }

            match self.resolve_anchor(&anchor_id, &anchor) {
                Ok(resolution) => {
                    tracing::info!(anchor = %anchor_id, ?resolution, "Reconciled pending transaction");
                    match resolution {
                        Resolution::Completed => report.completed += 1,
                        Resolution::Discarded => report.discarded += 1,
                        Resolution::RolledBack => report.rolled_back += 1,
                    }
                }
                Err(StorageError::Corruption(reason)) => {
                    tracing::error!(anchor = %anchor_id, %reason, "Pending transaction left for operator");
                    report.unresolved.push(anchor_id);
                }
                Err(e) => return Err(e),
            }
        }
        report.finished = true;
        Ok(report)
    }
}

/// Returns the caller-facing body, or `None` while the record is pending.
fn visible(kind: RecordKind, doc: Document) -> Option<Document> {
    if kind == RecordKind::Transaction {
        let status = doc.get(STATUS_FIELD).and_then(|s| s.as_str());
        if status == Some(STATUS_PENDING) {
            return None;
        }
    }
    Some(strip_driver_fields(doc))
}

fn strip_driver_fields(mut doc: Document) -> Document {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove(STATUS_FIELD);
        obj.remove(PENDING_SINCE_FIELD);
        obj.remove(PENDING_WRITES_FIELD);
    }
    doc
}

fn set_field(doc: &mut Document, field: &str, value: Value) -> StorageResult<()> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| StorageError::Other("document is not an object".to_string()))?;
    obj.insert(field.to_string(), value);
    Ok(())
}

fn revision_of(doc: &Document) -> Option<u64> {
    doc.get(REVISION_FIELD).and_then(|r| r.as_u64())
}

fn pending_age(anchor: &Document, now: OffsetDateTime) -> Option<Duration> {
    let since = anchor.get(PENDING_SINCE_FIELD)?.as_str()?;
    let since = parse_timestamp(PENDING_SINCE_FIELD, since).ok()?;
    // A timestamp from the future counts as brand new.
    Some(Duration::try_from(now - since).unwrap_or(Duration::ZERO))
}

fn pending_targets(anchor: &Document) -> HashSet<(String, String)> {
    anchor
        .get(PENDING_WRITES_FIELD)
        .and_then(|w| w.as_array())
        .map(|writes| {
            writes
                .iter()
                .filter_map(|w| {
                    Some((
                        w.get("collection")?.as_str()?.to_string(),
                        w.get("id")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDocumentStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryDocumentStore>, DocumentStoreDriver) {
        let store = Arc::new(MemoryDocumentStore::new());
        let driver = DocumentStoreDriver::new(store.clone(), Duration::from_secs(60));
        (store, driver)
    }

    fn account(id: &str, balance: &str, revision: u64) -> RawRecord {
        RawRecord::new(
            RecordKind::Account,
            id,
            json!({ "id": id, "balance": balance, "revision": revision }),
        )
    }

    fn txn(id: &str) -> RawRecord {
        RawRecord::new(RecordKind::Transaction, id, json!({ "id": id, "lines": [] }))
    }

    fn seed(driver: &DocumentStoreDriver) {
        driver.write(&account("cash", "0", 1)).unwrap();
        driver.write(&account("revenue", "0", 1)).unwrap();
    }

    fn post_batch() -> Vec<RawRecord> {
        vec![txn("t1"), account("cash", "100", 2), account("revenue", "-100", 2)]
    }

    #[test]
    fn test_commit_marks_transaction_committed() {
        let (store, driver) = setup();
        seed(&driver);
        driver.atomic_multi_write(&post_batch()).unwrap();

        let raw = store.get("transactions", "t1").unwrap().unwrap();
        assert_eq!(raw[STATUS_FIELD], STATUS_COMMITTED);
        assert!(raw.get(PENDING_WRITES_FIELD).is_none());

        // Callers never see driver bookkeeping.
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), Some(txn("t1").body));
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "100", 2).body)
        );
    }

    #[test]
    fn test_requires_single_anchor() {
        let (_store, driver) = setup();
        let result = driver.atomic_multi_write(&[account("cash", "1", 2), account("revenue", "-1", 2)]);
        assert!(matches!(result, Err(StorageError::Unsupported(_))));
        let result = driver.atomic_multi_write(&[txn("t1"), txn("t2")]);
        assert!(matches!(result, Err(StorageError::Unsupported(_))));
    }

    #[test]
    fn test_failure_mid_commit_rolls_back() {
        let (store, driver) = setup();
        seed(&driver);
        // Anchor insert and the first account update succeed.
        store.fail_writes_after(2);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        // The in-call rollback could not write either, so the anchor is still
        // pending and invisible.
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), None);
        assert!(driver.exists(RecordKind::Transaction, "t1").unwrap());

        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(report.rolled_back, 1);
        assert!(!driver.exists(RecordKind::Transaction, "t1").unwrap());
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "0", 1).body)
        );
        assert_eq!(
            driver.read(RecordKind::Account, "revenue").unwrap(),
            Some(account("revenue", "0", 1).body)
        );
    }

    #[test]
    fn test_reconcile_completes_fully_applied_commit() {
        let (store, driver) = setup();
        seed(&driver);
        // Everything but the final flip lands.
        store.fail_writes_after(3);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), Some(txn("t1").body));
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "100", 2).body)
        );
    }

    #[test]
    fn test_reconcile_discards_untouched_commit() {
        let (store, driver) = setup();
        seed(&driver);
        store.fail_writes_after(1);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(report.discarded, 1);
        assert!(!driver.exists(RecordKind::Transaction, "t1").unwrap());
    }

    #[test]
    fn test_reconcile_skips_fresh_pending() {
        let (store, driver) = setup();
        seed(&driver);
        store.fail_writes_after(1);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let report = driver
            .reconcile(Duration::from_secs(3600), &CancellationToken::new())
            .unwrap();
        assert_eq!(report.resolved(), 0);
        assert!(report.finished);
        assert!(driver.exists(RecordKind::Transaction, "t1").unwrap());
    }

    #[test]
    fn test_fresh_pending_claim_conflicts() {
        let (store, driver) = setup();
        seed(&driver);
        store.fail_writes_after(1);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let next = vec![txn("t2"), account("cash", "50", 2), account("revenue", "-50", 2)];
        assert!(matches!(driver.atomic_multi_write(&next), Err(StorageError::Conflict(_))));
    }

    #[test]
    fn test_stale_pending_claim_is_reconciled_first() {
        let store = Arc::new(MemoryDocumentStore::new());
        let driver = DocumentStoreDriver::new(store.clone(), Duration::ZERO);
        seed(&driver);
        store.fail_writes_after(2);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let next = vec![txn("t2"), account("cash", "50", 2), account("revenue", "-50", 2)];
        driver.atomic_multi_write(&next).unwrap();
        assert!(!driver.exists(RecordKind::Transaction, "t1").unwrap());
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "50", 2).body)
        );
    }

    #[test]
    fn test_write_built_on_rolled_back_state_conflicts() {
        let store = Arc::new(MemoryDocumentStore::new());
        let driver = DocumentStoreDriver::new(store.clone(), Duration::ZERO);
        seed(&driver);
        store.fail_writes_after(2);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        // Cash visibly holds the half-applied t1 image; a caller builds on it.
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "100", 2).body)
        );
        let next = vec![txn("t2"), account("cash", "110", 3), account("revenue", "-10", 2)];
        assert!(matches!(driver.atomic_multi_write(&next), Err(StorageError::Conflict(_))));

        // t1 was rolled back and nothing from t2 landed.
        assert!(!driver.exists(RecordKind::Transaction, "t1").unwrap());
        assert!(!driver.exists(RecordKind::Transaction, "t2").unwrap());
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account("cash", "0", 1).body)
        );
    }

    #[test]
    fn test_account_write_needs_next_revision() {
        let (_store, driver) = setup();
        seed(&driver);
        assert!(matches!(
            driver.write(&account("cash", "0", 1)),
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(
            driver.write(&account("bank", "0", 2)),
            Err(StorageError::Conflict(_))
        ));
        driver.write(&account("cash", "0", 2)).unwrap();
    }

    #[test]
    fn test_reconcile_stops_when_cancelled() {
        let (store, driver) = setup();
        seed(&driver);
        store.fail_writes_after(1);
        assert!(driver.atomic_multi_write(&post_batch()).is_err());
        store.clear_faults();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = driver.reconcile(Duration::ZERO, &cancel).unwrap();
        assert!(!report.finished);
        assert_eq!(report.resolved(), 0);
        assert!(driver.exists(RecordKind::Transaction, "t1").unwrap());
    }
}

//! File-tree storage backend for LedgerStore.
//!
//! Layout under the root directory:
//!
//! ```text
//! accounts/<id>.json
//! transactions/<id>.json
//! intent/<commit-id>.json   (only while a multi-record commit is in flight)
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! a record is always either its old or its new version. Multi-record
//! commits first persist an intent listing the before and after image of
//! every target. The intent is removed once all targets are renamed, and
//! any intent found on open is resolved before the driver is handed out.
//!
//! Writers are serialized by a process-local lock. Two processes writing
//! the same tree concurrently is not supported.

use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
    time::Duration,
};

use ledgerstore_core::{
    codec::{format_timestamp, parse_timestamp},
    storage::validate_key,
    BackendDriver, CancellationToken, Document, RawRecord, ReconcileReport, RecordKind, StorageError,
    StorageResult,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const INTENT_DIR: &str = "intent";
const RECORD_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Intent {
    commit_id: String,
    created_at: String,
    records: Vec<IntentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IntentRecord {
    collection: String,
    id: String,
    before: Option<Document>,
    after: Document,
}

#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    Completed,
    Discarded,
    RolledBack,
}

pub struct FileTreeDriver {
    root: PathBuf,
    writer: Mutex<()>,
    // Held for writing only while renames are in progress so that
    // in-process readers never observe half of a commit.
    visibility: RwLock<()>,
}

impl FileTreeDriver {
    /// Opens (creating if needed) a ledger tree and recovers any commit
    /// that was interrupted by a crash.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in RecordKind::ALL {
            fs::create_dir_all(root.join(kind.collection()))?;
        }
        fs::create_dir_all(root.join(INTENT_DIR))?;

        let driver = Self {
            root,
            writer: Mutex::new(()),
            visibility: RwLock::new(()),
        };

        driver.remove_temp_files()?;
        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new())?;
        if !report.unresolved.is_empty() {
            tracing::error!(
                root = %driver.root.display(),
                unresolved = ?report.unresolved,
                "Interrupted commits could not be recovered"
            );
            return Err(StorageError::Corruption(format!(
                "unresolved commit intents: {}",
                report.unresolved.join(", ")
            )));
        }
        if report.resolved() > 0 {
            tracing::info!(
                completed = report.completed,
                discarded = report.discarded,
                rolled_back = report.rolled_back,
                "Recovered interrupted commits"
            );
        }
        Ok(driver)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.root
            .join(kind.collection())
            .join(format!("{}.{}", id, RECORD_EXT))
    }

    fn intent_dir(&self) -> PathBuf {
        self.root.join(INTENT_DIR)
    }

    fn put_record(&self, kind: RecordKind, id: &str, body: &Document) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(body)?;
        write_atomic(&self.record_path(kind, id), &bytes)
    }

    fn remove_record(&self, kind: RecordKind, id: &str) -> StorageResult<()> {
        let path = self.record_path(kind, id);
        match fs::remove_file(&path) {
            Ok(()) => sync_parent(&path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_intent(&self, intent: &Intent) -> StorageResult<PathBuf> {
        let path = self
            .intent_dir()
            .join(format!("{}.{}", intent.commit_id, RECORD_EXT));
        let bytes = serde_json::to_vec_pretty(intent)?;
        write_atomic(&path, &bytes)?;
        Ok(path)
    }

    fn remove_intent(&self, path: &Path) -> StorageResult<()> {
        fs::remove_file(path)?;
        sync_parent(path)
    }

    /// Puts every target of `records` back to its before image.
    fn restore(&self, records: &[IntentRecord]) -> StorageResult<()> {
        for rec in records.iter().rev() {
            let kind = kind_of(rec)?;
            match &rec.before {
                Some(doc) => self.put_record(kind, &rec.id, doc)?,
                None => self.remove_record(kind, &rec.id)?,
            }
        }
        Ok(())
    }

    fn resolve_intent(&self, intent: &Intent) -> StorageResult<Resolution> {
        let mut applied = Vec::new();
        let mut pending = 0usize;

        for rec in &intent.records {
            let kind = kind_of(rec)?;
            let current = read_document(&self.record_path(kind, &rec.id)).map_err(|e| {
                StorageError::Corruption(format!("{} {} unreadable: {}", kind, rec.id, e))
            })?;
            if current.as_ref() == Some(&rec.after) {
                applied.push(rec.clone());
            } else if current == rec.before {
                pending += 1;
            } else {
                return Err(StorageError::Corruption(format!(
                    "{} {} matches neither side of commit {}",
                    kind, rec.id, intent.commit_id
                )));
            }
        }

        if pending == 0 {
            Ok(Resolution::Completed)
        } else if applied.is_empty() {
            Ok(Resolution::Discarded)
        } else {
            self.restore(&applied)?;
            Ok(Resolution::RolledBack)
        }
    }

    fn remove_temp_files(&self) -> StorageResult<()> {
        let dirs = RecordKind::ALL
            .iter()
            .map(|k| self.root.join(k.collection()))
            .chain(std::iter::once(self.intent_dir()));
        for dir in dirs {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                    tracing::warn!(path = %entry.path().display(), "Removing stray temp file");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}

impl BackendDriver for FileTreeDriver {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(&self, kind: RecordKind, id: &str) -> StorageResult<Option<Document>> {
        validate_key(id)?;
        let _visible = self.visibility.read().unwrap();
        read_document(&self.record_path(kind, id))
    }

    fn exists(&self, kind: RecordKind, id: &str) -> StorageResult<bool> {
        validate_key(id)?;
        Ok(self.record_path(kind, id).exists())
    }

    fn scan(&self, kind: RecordKind) -> StorageResult<Vec<RawRecord>> {
        let _visible = self.visibility.read().unwrap();
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join(kind.collection()))? {
            let entry = entry?;
            let path = entry.path();
            let is_record = path.extension().map_or(false, |ext| ext == RECORD_EXT);
            if !is_record {
                continue;
            }
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if !stem.starts_with('.') => stem.to_string(),
                _ => continue,
            };
            // A file removed between listing and reading is simply skipped.
            if let Some(body) = read_document(&path)? {
                records.push(RawRecord::new(kind, id, body));
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn write(&self, record: &RawRecord) -> StorageResult<()> {
        validate_key(&record.id)?;
        let _writer = self.writer.lock().unwrap();
        let _visible = self.visibility.write().unwrap();
        self.put_record(record.kind, &record.id, &record.body)
    }

    fn atomic_multi_write(&self, records: &[RawRecord]) -> StorageResult<()> {
        for rec in records {
            validate_key(&rec.id)?;
        }
        let _writer = self.writer.lock().unwrap();

        let mut targets = Vec::with_capacity(records.len());
        for rec in records {
            targets.push(IntentRecord {
                collection: rec.kind.collection().to_string(),
                id: rec.id.clone(),
                before: read_document(&self.record_path(rec.kind, &rec.id))?,
                after: rec.body.clone(),
            });
        }
        let intent = Intent {
            commit_id: uuid::Uuid::new_v4().to_string(),
            created_at: format_timestamp(OffsetDateTime::now_utc())
                .map_err(|e| StorageError::Other(e.to_string()))?,
            records: targets,
        };

        let _visible = self.visibility.write().unwrap();
        let intent_path = self.write_intent(&intent)?;

        for (applied, rec) in records.iter().enumerate() {
            if let Err(e) = self.put_record(rec.kind, &rec.id, &rec.body) {
                tracing::warn!(commit_id = %intent.commit_id, error = %e, "Commit failed, rolling back");
                match self.restore(&intent.records[..applied]) {
                    Ok(()) => {
                        if let Err(re) = self.remove_intent(&intent_path) {
                            tracing::warn!(commit_id = %intent.commit_id, error = %re, "Could not remove intent after rollback");
                        }
                    }
                    Err(re) => {
                        tracing::error!(commit_id = %intent.commit_id, error = %re, "Rollback failed, intent kept for recovery");
                    }
                }
                return Err(e);
            }
        }

        // All targets are in place. A leftover intent would be finalized by
        // the next recovery, so failing to remove it does not fail the commit.
        if let Err(e) = self.remove_intent(&intent_path) {
            tracing::warn!(commit_id = %intent.commit_id, error = %e, "Could not remove intent");
        }
        tracing::debug!(commit_id = %intent.commit_id, records = records.len(), "Commit applied");
        Ok(())
    }

    fn reconcile(&self, older_than: Duration, cancel: &CancellationToken) -> StorageResult<ReconcileReport> {
        let _writer = self.writer.lock().unwrap();
        let _visible = self.visibility.write().unwrap();
        let now = OffsetDateTime::now_utc();
        let grace = time::Duration::try_from(older_than).unwrap_or(time::Duration::MAX);

        let mut paths: Vec<PathBuf> = fs::read_dir(self.intent_dir())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == RECORD_EXT))
            .collect();
        paths.sort();

        let mut report = ReconcileReport::default();
        for path in paths {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            let name = path.display().to_string();
            let intent: Intent = match fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            {
                Ok(intent) => intent,
                Err(e) => {
                    tracing::error!(path = %name, error = %e, "Unreadable commit intent");
                    report.unresolved.push(name);
                    continue;
                }
            };

            match parse_timestamp("created_at", &intent.created_at) {
                Ok(created) if now - created < grace => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(commit_id = %intent.commit_id, error = %e, "Commit intent has no valid creation time");
                    report.unresolved.push(intent.commit_id);
                    continue;
                }
            }

            match self.resolve_intent(&intent) {
                Ok(resolution) => {
                    self.remove_intent(&path)?;
                    tracing::info!(commit_id = %intent.commit_id, ?resolution, "Resolved commit intent");
                    match resolution {
                        Resolution::Completed => report.completed += 1,
                        Resolution::Discarded => report.discarded += 1,
                        Resolution::RolledBack => report.rolled_back += 1,
                    }
                }
                Err(StorageError::Corruption(reason)) => {
                    tracing::error!(commit_id = %intent.commit_id, %reason, "Commit intent left for operator");
                    report.unresolved.push(intent.commit_id);
                }
                Err(e) => return Err(e),
            }
        }
        report.finished = true;
        Ok(report)
    }
}

fn kind_of(rec: &IntentRecord) -> StorageResult<RecordKind> {
    RecordKind::from_collection(&rec.collection)
        .ok_or_else(|| StorageError::Corruption(format!("unknown collection '{}'", rec.collection)))
}

fn read_document(path: &Path) -> StorageResult<Option<Document>> {
    match fs::read(path) {
        Ok(bytes) => {
            let doc = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Corruption(format!("{}: {}", path.display(), e))
            })?;
            Ok(Some(doc))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes `bytes` to a temp sibling, syncs it and renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let tmp = path.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX));

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_parent(path)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> StorageResult<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> StorageResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account_doc(id: &str, balance: &str, revision: u64) -> Document {
        json!({ "id": id, "name": id, "balance": balance, "revision": revision })
    }

    fn txn_doc(id: &str) -> Document {
        json!({ "id": id, "lines": [] })
    }

    fn intent_for(driver: &FileTreeDriver, records: &[RawRecord]) -> Intent {
        Intent {
            commit_id: uuid::Uuid::new_v4().to_string(),
            created_at: format_timestamp(OffsetDateTime::now_utc()).unwrap(),
            records: records
                .iter()
                .map(|r| IntentRecord {
                    collection: r.kind.collection().to_string(),
                    id: r.id.clone(),
                    before: driver.read(r.kind, &r.id).unwrap(),
                    after: r.body.clone(),
                })
                .collect(),
        }
    }

    fn intent_count(root: &Path) -> usize {
        fs::read_dir(root.join(INTENT_DIR)).unwrap().count()
    }

    #[test]
    fn test_write_read_scan() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileTreeDriver::open(dir.path()).unwrap();

        driver
            .write(&RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "0", 1)))
            .unwrap();
        driver
            .write(&RawRecord::new(RecordKind::Account, "bank", account_doc("bank", "0", 1)))
            .unwrap();

        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account_doc("cash", "0", 1))
        );
        assert_eq!(driver.read(RecordKind::Account, "missing").unwrap(), None);
        assert_eq!(driver.read(RecordKind::Transaction, "cash").unwrap(), None);

        let ids: Vec<String> = driver
            .scan(RecordKind::Account)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["bank".to_string(), "cash".to_string()]);
        assert!(dir.path().join("accounts").join("cash.json").exists());
    }

    #[test]
    fn test_rejects_unsafe_keys() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileTreeDriver::open(dir.path()).unwrap();
        let result = driver.write(&RawRecord::new(RecordKind::Account, "../escape", json!({})));
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_multi_write_leaves_no_intent() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileTreeDriver::open(dir.path()).unwrap();
        driver
            .write(&RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "0", 1)))
            .unwrap();

        driver
            .atomic_multi_write(&[
                RawRecord::new(RecordKind::Transaction, "t1", txn_doc("t1")),
                RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "100", 2)),
            ])
            .unwrap();

        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), Some(txn_doc("t1")));
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account_doc("cash", "100", 2))
        );
        assert_eq!(intent_count(dir.path()), 0);
    }

    #[test]
    fn test_recovery_rolls_back_partial_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = FileTreeDriver::open(dir.path()).unwrap();
            driver
                .write(&RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "0", 1)))
                .unwrap();
            let records = [
                RawRecord::new(RecordKind::Transaction, "t1", txn_doc("t1")),
                RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "100", 2)),
            ];
            let intent = intent_for(&driver, &records);
            driver.write_intent(&intent).unwrap();
            // Crash after the first rename.
            driver.put_record(RecordKind::Transaction, "t1", &records[0].body).unwrap();
        }

        let driver = FileTreeDriver::open(dir.path()).unwrap();
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), None);
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account_doc("cash", "0", 1))
        );
        assert_eq!(intent_count(dir.path()), 0);
    }

    #[test]
    fn test_recovery_finalizes_applied_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = FileTreeDriver::open(dir.path()).unwrap();
            driver
                .write(&RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "0", 1)))
                .unwrap();
            let records = [
                RawRecord::new(RecordKind::Transaction, "t1", txn_doc("t1")),
                RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "100", 2)),
            ];
            let intent = intent_for(&driver, &records);
            driver.write_intent(&intent).unwrap();
            for r in &records {
                driver.put_record(r.kind, &r.id, &r.body).unwrap();
            }
            // Crash before the intent is removed.
        }

        let driver = FileTreeDriver::open(dir.path()).unwrap();
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), Some(txn_doc("t1")));
        assert_eq!(
            driver.read(RecordKind::Account, "cash").unwrap(),
            Some(account_doc("cash", "100", 2))
        );
        assert_eq!(intent_count(dir.path()), 0);
    }

    #[test]
    fn test_recovery_discards_untouched_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = FileTreeDriver::open(dir.path()).unwrap();
            let records = [RawRecord::new(RecordKind::Transaction, "t1", txn_doc("t1"))];
            let intent = intent_for(&driver, &records);
            driver.write_intent(&intent).unwrap();
        }

        let driver = FileTreeDriver::open(dir.path()).unwrap();
        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(report.resolved(), 0);
        assert_eq!(driver.read(RecordKind::Transaction, "t1").unwrap(), None);
        assert_eq!(intent_count(dir.path()), 0);
    }

    #[test]
    fn test_recovery_reports_foreign_write() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = FileTreeDriver::open(dir.path()).unwrap();
            driver
                .write(&RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "0", 1)))
                .unwrap();
            let records = [RawRecord::new(RecordKind::Account, "cash", account_doc("cash", "100", 2))];
            let intent = intent_for(&driver, &records);
            driver.write_intent(&intent).unwrap();
            driver
                .put_record(RecordKind::Account, "cash", &account_doc("cash", "999", 7))
                .unwrap();
        }

        assert!(matches!(
            FileTreeDriver::open(dir.path()),
            Err(StorageError::Corruption(_))
        ));
        assert_eq!(intent_count(dir.path()), 1);
    }

    #[test]
    fn test_open_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        FileTreeDriver::open(dir.path()).unwrap();
        let stray = dir.path().join("transactions").join(".t9.json.tmp");
        fs::write(&stray, b"{\"id\":").unwrap();

        let driver = FileTreeDriver::open(dir.path()).unwrap();
        assert!(!stray.exists());
        assert!(driver.scan(RecordKind::Transaction).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_respects_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileTreeDriver::open(dir.path()).unwrap();
        let records = [RawRecord::new(RecordKind::Transaction, "t1", txn_doc("t1"))];
        let intent = intent_for(&driver, &records);
        driver.write_intent(&intent).unwrap();

        let report = driver
            .reconcile(Duration::from_secs(3600), &CancellationToken::new())
            .unwrap();
        assert_eq!(report.resolved(), 0);
        assert_eq!(intent_count(dir.path()), 1);

        let report = driver.reconcile(Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(report.discarded, 1);
        assert!(report.finished);
    }
}

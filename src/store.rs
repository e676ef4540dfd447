use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use ledgerstore_core::{
    codec::{decode_account, decode_transaction, encode_account, encode_transaction},
    new_id, Account, AccountKind, BackendDriver, CancellationToken, Line, RawRecord, ReconcileReport, RecordKind,
    Transaction,
};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::{
    checker::{self, normalize_name, AuditReport, ConsistencyChecker, Violation},
    error::{LedgerError, LedgerResult},
};

/// Ledger-level policies, fixed when the store is built.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOptions {
    /// Reject a new account whose trimmed, case-folded name is taken.
    pub unique_account_names: bool,
    /// Keep a running balance on each account record, updated in the same
    /// atomic commit as the transaction that changes it. A balance already
    /// stored on an account is kept current whatever this says.
    pub cache_balances: bool,
    /// How old an interrupted commit must be before reconciliation touches it.
    pub reconciliation_grace_period: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            unique_account_names: false,
            cache_balances: false,
            reconciliation_grace_period: Duration::from_secs(300),
        }
    }
}

/// Input to [`LedgerStore::import_transactions`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDraft {
    pub description: String,
    pub currency: Option<String>,
    pub lines: Vec<Line>,
}

impl TransactionDraft {
    pub fn new(description: impl Into<String>, lines: Vec<Line>) -> Self {
        Self {
            description: description.into(),
            currency: None,
            lines,
        }
    }

    pub fn with_currency(mut self, code: impl Into<String>) -> Self {
        self.currency = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    /// Ids of the posted transactions, in draft order.
    pub posted: Vec<String>,
    /// Set when the backfill stopped at a draft that failed validation.
    /// That draft is at index `posted.len()`.
    pub rejected: Option<Violation>,
}

/// Position of the newest transaction in the log.
#[derive(Debug, Clone, Copy)]
struct LogTail {
    sequence: u64,
    timestamp: OffsetDateTime,
}

/// The ledger. All mutations go through here and are checked before they
/// reach the driver.
pub struct LedgerStore {
    driver: Arc<dyn BackendDriver>,
    checker: ConsistencyChecker,
    options: LedgerOptions,
    /// Serializes mutations. Holds the log tail, loaded on first post.
    write_lock: Mutex<Option<LogTail>>,
}

impl LedgerStore {
    pub fn new(driver: Arc<dyn BackendDriver>, options: LedgerOptions) -> Self {
        let checker = ConsistencyChecker::new(driver.clone()).with_unique_account_names(options.unique_account_names);
        Self {
            driver,
            checker,
            options,
            write_lock: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn create_account(&self, name: &str, kind: AccountKind) -> LedgerResult<Account> {
        self.create_account_in(name, kind, None)
    }

    /// Creates an account grouped under `parent_id`, which must exist and
    /// still be open.
    pub fn create_sub_account(&self, name: &str, kind: AccountKind, parent_id: &str) -> LedgerResult<Account> {
        self.create_account_in(name, kind, Some(parent_id))
    }

    fn create_account_in(&self, name: &str, kind: AccountKind, parent_id: Option<&str>) -> LedgerResult<Account> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Violation::InvalidName { name: name.to_string() }.into());
        }

        let _guard = self.lock();
        if let Some(parent_id) = parent_id {
            let parent = match self.read_account(parent_id) {
                Ok(parent) => parent,
                Err(LedgerError::NotFound { .. }) => {
                    return Err(Violation::UnknownAccount {
                        account_id: parent_id.to_string(),
                    }
                    .into())
                }
                Err(e) => return Err(e),
            };
            if parent.is_retired() {
                return Err(Violation::RetiredAccount { account_id: parent.id }.into());
            }
        }
        if self.options.unique_account_names {
            let wanted = normalize_name(name);
            for account in self.load_accounts()? {
                if normalize_name(&account.name) == wanted {
                    return Err(Violation::DuplicateName { name: name.to_string() }.into());
                }
            }
        }

        let mut account = Account::new(
            self.fresh_id(RecordKind::Account)?,
            name.to_string(),
            kind,
            OffsetDateTime::now_utc(),
        );
        account.parent_id = parent_id.map(str::to_string);
        if self.options.cache_balances {
            account.balance = Some(Decimal::ZERO);
        }

        self.commit(vec![account_record(&account)?])?;
        self.confirm(RecordKind::Account, &account.id)?;
        tracing::debug!(account = %account.id, name = %account.name, kind = %account.kind, "Account created");
        Ok(account)
    }

    /// Validates and commits a balanced transaction.
    ///
    /// A `Corruption` error raised after the driver accepted the commit
    /// means the transaction was written but cannot be read back.
    pub fn post_transaction(&self, description: &str, lines: Vec<Line>) -> LedgerResult<Transaction> {
        self.post_draft(&TransactionDraft::new(description, lines))
    }

    /// Like [`post_transaction`](Self::post_transaction), carrying the
    /// draft's currency tag.
    pub fn post_draft(&self, draft: &TransactionDraft) -> LedgerResult<Transaction> {
        let mut guard = self.lock();
        self.post_locked(&mut guard, draft, None)
    }

    /// Signed sum of every committed line against the account.
    pub fn get_balance(&self, account_id: &str) -> LedgerResult<Decimal> {
        let account = self.get_account(account_id)?;
        if self.options.cache_balances {
            if let Some(balance) = account.balance {
                return Ok(balance);
            }
        }
        self.balance_from_log(account_id)
    }

    /// Balance of the account plus every account grouped under it, at any
    /// depth.
    pub fn get_rollup_balance(&self, account_id: &str) -> LedgerResult<Decimal> {
        let root = self.get_account(account_id)?;
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for account in self.load_accounts()? {
            if let Some(parent_id) = account.parent_id {
                children.entry(parent_id).or_default().push(account.id);
            }
        }

        let mut total = Decimal::ZERO;
        let mut seen = HashSet::new();
        let mut queue = vec![root.id];
        while let Some(id) = queue.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            total = checker::add_to_balance(account_id, total, self.get_balance(&id)?)?;
            if let Some(kids) = children.remove(&id) {
                queue.extend(kids);
            }
        }
        Ok(total)
    }

    /// Transactions ordered by timestamp, optionally restricted to one
    /// account and to those at or after `since`. Nothing is read until the
    /// returned sequence is iterated.
    pub fn list_transactions(&self, account_id: Option<&str>, since: Option<OffsetDateTime>) -> Transactions {
        Transactions {
            driver: self.driver.clone(),
            account_id: account_id.map(str::to_string),
            since,
        }
    }

    pub fn retire_account(&self, account_id: &str) -> LedgerResult<Account> {
        let _guard = self.lock();
        let mut retried = false;
        loop {
            let mut account = self.read_account(account_id)?;
            if account.is_retired() {
                return Err(LedgerError::Conflict(format!("account {} is already retired", account_id)));
            }
            account.retired_at = Some(OffsetDateTime::now_utc());
            account.revision += 1;

            match self.commit(vec![account_record(&account)?]) {
                Err(LedgerError::Conflict(reason)) if !retried => {
                    tracing::warn!(account = %account.id, %reason, "Retire conflicted, retrying against fresh state");
                    retried = true;
                }
                result => {
                    result?;
                    tracing::info!(account = %account.id, "Account retired");
                    return Ok(account);
                }
            }
        }
    }

    pub fn get_account(&self, account_id: &str) -> LedgerResult<Account> {
        self.read_account(account_id)
    }

    /// Accounts sorted by name. Undecodable records are skipped.
    pub fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .driver
            .scan(RecordKind::Account)?
            .into_iter()
            .filter_map(|raw| match decode_account(&raw.id, &raw.body) {
                Ok(account) => Some(account),
                Err(e) => {
                    tracing::warn!(account = %raw.id, error = %e, "Skipping corrupt account record");
                    None
                }
            })
            .collect();
        accounts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(accounts)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        ensure_key(RecordKind::Transaction, transaction_id)?;
        let body = self
            .driver
            .read(RecordKind::Transaction, transaction_id)?
            .ok_or_else(|| LedgerError::not_found(RecordKind::Transaction, transaction_id))?;
        Ok(decode_transaction(transaction_id, &body)?)
    }

    /// Posts the mirror image of a committed transaction. The original is
    /// left untouched and can be reversed only once.
    pub fn reverse_transaction(&self, transaction_id: &str, description: Option<&str>) -> LedgerResult<Transaction> {
        let mut guard = self.lock();
        let original = self.get_transaction(transaction_id)?;

        for raw in self.driver.scan(RecordKind::Transaction)? {
            let reverses = raw.body.get("reverses").and_then(|r| r.as_str());
            if reverses == Some(transaction_id) {
                return Err(LedgerError::Conflict(format!(
                    "transaction {} is already reversed by {}",
                    transaction_id, raw.id
                )));
            }
        }

        let lines = original
            .lines
            .iter()
            .map(|l| Line::new(l.account_id.clone(), -l.amount))
            .collect();
        let description = match description {
            Some(d) => d.to_string(),
            None => format!("Reversal of {}", original.id),
        };
        let draft = TransactionDraft {
            description,
            currency: original.currency.clone(),
            lines,
        };
        self.post_locked(&mut guard, &draft, Some(&original.id))
    }

    /// Posts drafts in order, one commit each.
    ///
    /// Stops at the first draft that fails validation and reports it.
    /// Cancellation is checked between drafts and surfaces as
    /// [`LedgerError::Cancelled`] with the number already posted, so a rerun
    /// can skip that many drafts.
    pub fn import_transactions<I>(&self, drafts: I, cancel: &CancellationToken) -> LedgerResult<BackfillReport>
    where
        I: IntoIterator<Item = TransactionDraft>,
    {
        let mut report = BackfillReport::default();
        for draft in drafts {
            if cancel.is_cancelled() {
                tracing::warn!(posted = report.posted.len(), "Backfill cancelled");
                return Err(LedgerError::Cancelled {
                    processed: report.posted.len(),
                });
            }
            match self.post_draft(&draft) {
                Ok(txn) => report.posted.push(txn.id),
                Err(LedgerError::Validation(v)) => {
                    tracing::warn!(index = report.posted.len(), violation = %v, "Backfill stopped at invalid draft");
                    report.rejected = Some(v);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    pub fn audit_ledger(&self, cancel: &CancellationToken) -> LedgerResult<AuditReport> {
        self.checker.audit_ledger(cancel)
    }

    pub fn reconcile(&self, cancel: &CancellationToken) -> LedgerResult<ReconcileReport> {
        self.checker.reconcile(self.options.reconciliation_grace_period, cancel)
    }

    fn lock(&self) -> MutexGuard<'_, Option<LogTail>> {
        self.write_lock.lock().unwrap()
    }

    /// Posts under the write lock. A commit conflict means the driver
    /// changed records underneath the images built here, so the post is
    /// rebuilt from fresh reads once.
    fn post_locked(
        &self,
        tail: &mut Option<LogTail>,
        draft: &TransactionDraft,
        reverses: Option<&str>,
    ) -> LedgerResult<Transaction> {
        match self.try_post(tail, draft, reverses) {
            Err(LedgerError::Conflict(reason)) => {
                tracing::warn!(%reason, "Commit conflicted, retrying against fresh state");
                self.try_post(tail, draft, reverses)
            }
            other => other,
        }
    }

    fn try_post(
        &self,
        tail: &mut Option<LogTail>,
        draft: &TransactionDraft,
        reverses: Option<&str>,
    ) -> LedgerResult<Transaction> {
        let lines = draft.lines.clone();
        checker::check_currency(draft.currency.as_deref())?;

        // Validate against what the driver holds right now.
        let mut known = HashMap::new();
        let referenced: BTreeSet<String> = lines.iter().map(|l| l.account_id.clone()).collect();
        for id in &referenced {
            match self.read_account(id) {
                Ok(account) => {
                    known.insert(account.id.clone(), account);
                }
                Err(LedgerError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        checker::validate_transaction("", &lines, &known)?;
        checker::check_postable(&lines, &known)?;

        let next = self.next_position(tail)?;
        let txn = Transaction {
            id: self.fresh_id(RecordKind::Transaction)?,
            sequence: next.sequence,
            timestamp: next.timestamp,
            description: draft.description.clone(),
            currency: draft.currency.clone(),
            lines,
            reverses: reverses.map(str::to_string),
        };

        let mut records = vec![RawRecord::new(
            RecordKind::Transaction,
            &txn.id,
            encode_transaction(&txn)?,
        )];
        // A stored balance goes stale unless every post updates it, so it
        // is maintained even when caching is now off.
        for id in &referenced {
            let mut account = known
                .remove(id.as_str())
                .ok_or_else(|| LedgerError::not_found(RecordKind::Account, id.as_str()))?;
            let current = match account.balance {
                Some(b) => b,
                None if self.options.cache_balances => self.balance_from_log(id)?,
                None => continue,
            };
            let delta = txn.amount_for(id).ok_or_else(|| overflow(id))?;
            account.balance = Some(checker::add_to_balance(id, current, delta)?);
            account.revision += 1;
            records.push(account_record(&account)?);
        }

        // Positions are never handed out twice, even if this commit fails.
        *tail = Some(next);
        self.commit(records)?;
        self.confirm(RecordKind::Transaction, &txn.id)?;
        tracing::debug!(
            transaction = %txn.id,
            sequence = txn.sequence,
            lines = txn.lines.len(),
            "Transaction posted"
        );
        Ok(txn)
    }

    fn commit(&self, records: Vec<RawRecord>) -> LedgerResult<()> {
        match records.as_slice() {
            [single] => self.driver.write(single)?,
            many => self.driver.atomic_multi_write(many)?,
        }
        Ok(())
    }

    /// Reads back a record the driver just accepted. A failed read is only
    /// logged since the write itself went through.
    fn confirm(&self, kind: RecordKind, id: &str) -> LedgerResult<()> {
        match self.driver.read(kind, id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(LedgerError::Corruption(format!(
                "{} {} was committed but is not visible",
                kind, id
            ))),
            Err(e) => {
                tracing::warn!(%kind, %id, error = %e, "Could not read back committed record");
                Ok(())
            }
        }
    }

    fn next_position(&self, tail: &Option<LogTail>) -> LedgerResult<LogTail> {
        let last = match tail {
            Some(t) => Some(*t),
            None => self.load_tail()?,
        };
        let now = OffsetDateTime::now_utc();
        Ok(match last {
            Some(t) => LogTail {
                sequence: t.sequence + 1,
                timestamp: now.max(t.timestamp),
            },
            None => LogTail {
                sequence: 1,
                timestamp: now,
            },
        })
    }

    fn load_tail(&self) -> LedgerResult<Option<LogTail>> {
        let mut tail: Option<LogTail> = None;
        for raw in self.driver.scan(RecordKind::Transaction)? {
            let txn = decode_transaction(&raw.id, &raw.body)?;
            if tail.map_or(true, |t| txn.sequence > t.sequence) {
                tail = Some(LogTail {
                    sequence: txn.sequence,
                    timestamp: txn.timestamp,
                });
            }
        }
        Ok(tail)
    }

    fn fresh_id(&self, kind: RecordKind) -> LedgerResult<String> {
        loop {
            let id = new_id();
            if !self.driver.exists(RecordKind::Account, &id)? && !self.driver.exists(RecordKind::Transaction, &id)? {
                return Ok(id);
            }
            tracing::warn!(%kind, %id, "Generated id already taken, retrying");
        }
    }

    fn read_account(&self, account_id: &str) -> LedgerResult<Account> {
        ensure_key(RecordKind::Account, account_id)?;
        let body = self
            .driver
            .read(RecordKind::Account, account_id)?
            .ok_or_else(|| LedgerError::not_found(RecordKind::Account, account_id))?;
        Ok(decode_account(account_id, &body)?)
    }

    fn load_accounts(&self) -> LedgerResult<Vec<Account>> {
        self.driver
            .scan(RecordKind::Account)?
            .into_iter()
            .map(|raw| Ok(decode_account(&raw.id, &raw.body)?))
            .collect()
    }

    fn balance_from_log(&self, account_id: &str) -> LedgerResult<Decimal> {
        let mut balance = Decimal::ZERO;
        for raw in self.driver.scan(RecordKind::Transaction)? {
            let txn = decode_transaction(&raw.id, &raw.body)?;
            let amount = txn.amount_for(account_id).ok_or_else(|| overflow(account_id))?;
            balance = checker::add_to_balance(account_id, balance, amount)?;
        }
        Ok(balance)
    }
}

fn overflow(account_id: &str) -> Violation {
    Violation::AmountOverflow {
        account_id: account_id.to_string(),
    }
}

/// An id no record could be stored under is simply absent.
fn ensure_key(kind: RecordKind, id: &str) -> LedgerResult<()> {
    ledgerstore_core::storage::validate_key(id).map_err(|_| LedgerError::not_found(kind, id))
}

fn account_record(account: &Account) -> LedgerResult<RawRecord> {
    Ok(RawRecord::new(
        RecordKind::Account,
        &account.id,
        encode_account(account)?,
    ))
}

/// Restartable view over the transaction log. Every call to
/// [`iter`](Self::iter) reads the current committed state afresh.
pub struct Transactions {
    driver: Arc<dyn BackendDriver>,
    account_id: Option<String>,
    since: Option<OffsetDateTime>,
}

impl Transactions {
    pub fn iter(&self) -> LedgerResult<std::vec::IntoIter<Transaction>> {
        let mut txns: Vec<Transaction> = Vec::new();
        for raw in self.driver.scan(RecordKind::Transaction)? {
            let txn = match decode_transaction(&raw.id, &raw.body) {
                Ok(txn) => txn,
                Err(e) => {
                    tracing::warn!(transaction = %raw.id, error = %e, "Skipping corrupt transaction record");
                    continue;
                }
            };
            if let Some(account_id) = &self.account_id {
                if !txn.touches(account_id) {
                    continue;
                }
            }
            if let Some(since) = self.since {
                if txn.timestamp < since {
                    continue;
                }
            }
            txns.push(txn);
        }
        txns.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.sequence.cmp(&b.sequence)));
        Ok(txns.into_iter())
    }

    pub fn collect_vec(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(self.iter()?.collect())
    }
}

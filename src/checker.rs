//! Ledger rule checks.
//!
//! [`validate_transaction`] is the pure double-entry check run before every
//! commit. [`ConsistencyChecker`] runs the same rules over everything a
//! driver holds, plus the checks that only make sense over a full ledger:
//! id uniqueness across kinds and cached balances against the log.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use ledgerstore_core::{
    codec::{decode_account, decode_transaction},
    is_currency_code, Account, BackendDriver, CancellationToken, Line, RecordKind, ReconcileReport,
};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::error::LedgerResult;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("transaction {transaction_id} does not balance: lines sum to {total}")]
    UnbalancedTransaction { transaction_id: String, total: Decimal },
    #[error("line references unknown account {account_id}")]
    UnknownAccount { account_id: String },
    #[error("account {account_id} is retired")]
    RetiredAccount { account_id: String },
    #[error("transaction {transaction_id} has {lines} line(s), at least 2 are required")]
    EmptyTransaction { transaction_id: String, lines: usize },
    #[error("line for account {account_id} has a zero amount")]
    ZeroAmountLine { account_id: String },
    #[error("an account named '{name}' already exists")]
    DuplicateName { name: String },
    #[error("invalid account name '{name}'")]
    InvalidName { name: String },
    #[error("'{code}' is not a three-letter currency code")]
    InvalidCurrency { code: String },
    #[error("amounts for account {account_id} overflow the decimal range")]
    AmountOverflow { account_id: String },
    #[error("account {account_id} names unknown parent {parent_id}")]
    UnknownParent { account_id: String, parent_id: String },
    #[error("account {account_id} is its own ancestor")]
    ParentCycle { account_id: String },
    #[error("id {id} is used by more than one record")]
    DuplicateId { id: String },
    #[error("account {account_id} caches balance {cached} but its transactions sum to {computed}")]
    BalanceMismatch {
        account_id: String,
        cached: Decimal,
        computed: Decimal,
    },
    #[error("{kind} {id} cannot be decoded: {reason}")]
    CorruptRecord {
        kind: RecordKind,
        id: String,
        reason: String,
    },
}

/// Checks the double-entry rules for one transaction.
///
/// `transaction_id` only labels the violation; a transaction being posted
/// has no id yet and passes an empty string.
pub fn validate_transaction(
    transaction_id: &str,
    lines: &[Line],
    known_accounts: &HashMap<String, Account>,
) -> Result<(), Violation> {
    if lines.len() < 2 {
        return Err(Violation::EmptyTransaction {
            transaction_id: transaction_id.to_string(),
            lines: lines.len(),
        });
    }

    for line in lines {
        if !known_accounts.contains_key(&line.account_id) {
            return Err(Violation::UnknownAccount {
                account_id: line.account_id.clone(),
            });
        }
        if line.amount.is_zero() {
            return Err(Violation::ZeroAmountLine {
                account_id: line.account_id.clone(),
            });
        }
    }

    let mut total = Decimal::ZERO;
    for line in lines {
        total = total
            .checked_add(line.amount)
            .ok_or_else(|| Violation::AmountOverflow {
                account_id: line.account_id.clone(),
            })?;
    }
    if !total.is_zero() {
        return Err(Violation::UnbalancedTransaction {
            transaction_id: transaction_id.to_string(),
            total,
        });
    }
    Ok(())
}

/// Rejects new lines against retired accounts. Committed history may still
/// reference them, so audits do not apply this rule.
pub fn check_postable(lines: &[Line], known_accounts: &HashMap<String, Account>) -> Result<(), Violation> {
    for line in lines {
        if let Some(account) = known_accounts.get(&line.account_id) {
            if account.is_retired() {
                return Err(Violation::RetiredAccount {
                    account_id: account.id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Tags must look like `USD`. No conversion is ever applied.
pub fn check_currency(currency: Option<&str>) -> Result<(), Violation> {
    match currency {
        Some(code) if !is_currency_code(code) => Err(Violation::InvalidCurrency { code: code.to_string() }),
        _ => Ok(()),
    }
}

/// Adds `amount` to a running balance, reporting overflow against the
/// account.
pub fn add_to_balance(account_id: &str, balance: Decimal, amount: Decimal) -> Result<Decimal, Violation> {
    balance.checked_add(amount).ok_or_else(|| Violation::AmountOverflow {
        account_id: account_id.to_string(),
    })
}

/// Normalized form used to compare account names.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    pub accounts_checked: usize,
    pub transactions_checked: usize,
    pub violations: Vec<Violation>,
    /// False when the audit was cancelled before visiting every record.
    pub completed: bool,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct ConsistencyChecker {
    driver: Arc<dyn BackendDriver>,
    unique_account_names: bool,
}

impl ConsistencyChecker {
    pub fn new(driver: Arc<dyn BackendDriver>) -> Self {
        Self {
            driver,
            unique_account_names: false,
        }
    }

    /// Also reports accounts sharing a name.
    pub fn with_unique_account_names(mut self, unique: bool) -> Self {
        self.unique_account_names = unique;
        self
    }

    /// Read-only sweep over the whole ledger. It takes no locks, so a commit
    /// in flight may show up as a false positive; re-run to confirm.
    pub fn audit_ledger(&self, cancel: &CancellationToken) -> LedgerResult<AuditReport> {
        let mut report = AuditReport::default();
        let mut accounts: HashMap<String, Account> = HashMap::new();
        let mut names: HashSet<String> = HashSet::new();

        for raw in self.driver.scan(RecordKind::Account)? {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            report.accounts_checked += 1;
            match decode_account(&raw.id, &raw.body) {
                Ok(account) => {
                    if self.unique_account_names && !names.insert(normalize_name(&account.name)) {
                        report.violations.push(Violation::DuplicateName {
                            name: account.name.clone(),
                        });
                    }
                    accounts.insert(account.id.clone(), account);
                }
                Err(e) => report.violations.push(Violation::CorruptRecord {
                    kind: RecordKind::Account,
                    id: raw.id,
                    reason: e.to_string(),
                }),
            }
        }

        report.violations.extend(hierarchy_violations(&accounts));

        // `None` marks a balance that no longer fits a Decimal.
        let mut computed: HashMap<String, Option<Decimal>> = HashMap::new();
        for raw in self.driver.scan(RecordKind::Transaction)? {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            report.transactions_checked += 1;
            if accounts.contains_key(&raw.id) {
                report.violations.push(Violation::DuplicateId { id: raw.id.clone() });
            }
            let txn = match decode_transaction(&raw.id, &raw.body) {
                Ok(txn) => txn,
                Err(e) => {
                    report.violations.push(Violation::CorruptRecord {
                        kind: RecordKind::Transaction,
                        id: raw.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if let Err(v) = validate_transaction(&txn.id, &txn.lines, &accounts) {
                report.violations.push(v);
            }
            for line in &txn.lines {
                let entry = computed.entry(line.account_id.clone()).or_insert(Some(Decimal::ZERO));
                *entry = entry.and_then(|b| b.checked_add(line.amount));
            }
        }

        let mut ids: Vec<&String> = accounts.keys().collect();
        ids.sort();
        for id in ids {
            let account = &accounts[id];
            let actual = match computed.get(id) {
                Some(Some(b)) => *b,
                Some(None) => {
                    report.violations.push(Violation::AmountOverflow { account_id: id.clone() });
                    continue;
                }
                None => Decimal::ZERO,
            };
            if let Some(cached) = account.balance {
                if cached != actual {
                    report.violations.push(Violation::BalanceMismatch {
                        account_id: id.clone(),
                        cached,
                        computed: actual,
                    });
                }
            }
        }

        report.completed = true;
        if report.is_clean() {
            tracing::info!(
                accounts = report.accounts_checked,
                transactions = report.transactions_checked,
                "Ledger audit passed"
            );
        } else {
            tracing::error!(violations = report.violations.len(), "Ledger audit found violations");
        }
        Ok(report)
    }

    /// Resolves commits interrupted more than `grace` ago.
    pub fn reconcile(&self, grace: Duration, cancel: &CancellationToken) -> LedgerResult<ReconcileReport> {
        let report = self.driver.reconcile(grace, cancel)?;
        if !report.unresolved.is_empty() {
            tracing::error!(
                backend = self.driver.name(),
                unresolved = ?report.unresolved,
                "Interrupted commits need operator attention"
            );
        } else if report.resolved() > 0 {
            tracing::info!(
                backend = self.driver.name(),
                completed = report.completed,
                discarded = report.discarded,
                rolled_back = report.rolled_back,
                "Reconciled interrupted commits"
            );
        }
        Ok(report)
    }
}

/// Dangling parent references and parent chains that loop back.
fn hierarchy_violations(accounts: &HashMap<String, Account>) -> Vec<Violation> {
    let mut ids: Vec<&String> = accounts.keys().collect();
    ids.sort();

    let mut violations = Vec::new();
    for id in ids {
        let mut seen = HashSet::from([id.as_str()]);
        let mut current = &accounts[id];
        while let Some(parent_id) = current.parent_id.as_deref() {
            let Some(parent) = accounts.get(parent_id) else {
                if current.id == *id {
                    violations.push(Violation::UnknownParent {
                        account_id: id.clone(),
                        parent_id: parent_id.to_string(),
                    });
                }
                break;
            };
            if !seen.insert(parent_id) {
                if parent_id == id.as_str() {
                    violations.push(Violation::ParentCycle { account_id: id.clone() });
                }
                break;
            }
            current = parent;
        }
    }
    violations
}

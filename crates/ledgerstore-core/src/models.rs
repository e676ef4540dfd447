use std::{fmt::Display, str::FromStr};

use rust_decimal::Decimal;
use time::OffsetDateTime;

/// Closed set of account kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountKind {
    pub const ALL: [AccountKind; 5] = [
        AccountKind::Asset,
        AccountKind::Liability,
        AccountKind::Equity,
        AccountKind::Income,
        AccountKind::Expense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Asset => "asset",
            AccountKind::Liability => "liability",
            AccountKind::Equity => "equity",
            AccountKind::Income => "income",
            AccountKind::Expense => "expense",
        }
    }

    /// Asset and expense accounts normally carry a debit (positive) balance.
    pub fn is_debit_normal(&self) -> bool {
        matches!(self, AccountKind::Asset | AccountKind::Expense)
    }

    /// Flips a signed balance so that the account's normal side reads
    /// positive: an income account credited 100 shows 100.
    pub fn natural_balance(&self, balance: Decimal) -> Decimal {
        if self.is_debit_normal() {
            balance
        } else {
            -balance
        }
    }
}

impl Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asset" => Ok(AccountKind::Asset),
            "liability" => Ok(AccountKind::Liability),
            "equity" => Ok(AccountKind::Equity),
            "income" => Ok(AccountKind::Income),
            "expense" => Ok(AccountKind::Expense),
            other => Err(format!("unknown account kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub kind: AccountKind,
    /// Grouping account this one rolls up into.
    pub parent_id: Option<String>,
    pub created_at: OffsetDateTime,
    /// Set once the account is retired; retired accounts accept no new lines.
    pub retired_at: Option<OffsetDateTime>,
    /// Cached balance. Only maintained when balance caching is enabled and
    /// always reconcilable against the transaction log.
    pub balance: Option<Decimal>,
    /// Bumped on every rewrite of the account record.
    pub revision: u64,
}

impl Account {
    pub fn new(id: String, name: String, kind: AccountKind, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            name,
            kind,
            parent_id: None,
            created_at,
            retired_at: None,
            balance: None,
            revision: 1,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// One line of a transaction. Debits are positive, credits negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line {
    pub account_id: String,
    pub amount: Decimal,
}

impl Line {
    pub fn new(account_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
        }
    }

    pub fn debit(account_id: impl Into<String>, amount: Decimal) -> Self {
        Self::new(account_id, amount.abs())
    }

    pub fn credit(account_id: impl Into<String>, amount: Decimal) -> Self {
        Self::new(account_id, -amount.abs())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    /// Append position in the ledger, strictly increasing.
    pub sequence: u64,
    pub timestamp: OffsetDateTime,
    pub description: String,
    /// ISO 4217 style code the amounts are denominated in. A tag only;
    /// nothing converts between currencies.
    pub currency: Option<String>,
    pub lines: Vec<Line>,
    /// Id of the transaction this one reverses, if any.
    pub reverses: Option<String>,
}

impl Transaction {
    /// Sum of all line amounts, or `None` if it does not fit a `Decimal`.
    /// Zero for every committed transaction.
    pub fn total(&self) -> Option<Decimal> {
        checked_sum(self.lines.iter().map(|l| l.amount))
    }

    /// Net effect of this transaction on a single account, or `None` on
    /// overflow.
    pub fn amount_for(&self, account_id: &str) -> Option<Decimal> {
        checked_sum(
            self.lines
                .iter()
                .filter(|l| l.account_id == account_id)
                .map(|l| l.amount),
        )
    }

    pub fn touches(&self, account_id: &str) -> bool {
        self.lines.iter().any(|l| l.account_id == account_id)
    }
}

/// Adds amounts without panicking; `None` once the sum leaves the range of
/// a `Decimal`.
pub fn checked_sum<I: IntoIterator<Item = Decimal>>(amounts: I) -> Option<Decimal> {
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(amount))
}

/// Three ASCII uppercase letters, such as `USD`.
pub fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

//! Record codec: maps accounts and transactions onto JSON documents.
//!
//! A document is the native representation for every backend. The file
//! driver stores one pretty-printed document per file and the document
//! store keeps them as-is. Decimals are written as strings and timestamps
//! as RFC 3339 so no precision is lost in either medium.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{is_currency_code, Account, AccountKind, Line, Transaction};

pub type Document = Value;

/// Field carrying the record revision. Drivers rely on it to tell whether
/// a multi-record commit reached a record.
pub const REVISION_FIELD: &str = "revision";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("document is not an object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("record stored under '{expected}' carries id '{found}'")]
    IdMismatch { expected: String, found: String },
}

pub fn format_timestamp(ts: OffsetDateTime) -> Result<String, CodecError> {
    ts.format(&Rfc3339).map_err(|e| CodecError::InvalidField {
        field: "timestamp".to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_timestamp(field: &str, s: &str) -> Result<OffsetDateTime, CodecError> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| CodecError::InvalidField {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub fn encode_account(account: &Account) -> Result<Document, CodecError> {
    let retired_at = match account.retired_at {
        Some(ts) => Value::String(format_timestamp(ts)?),
        None => Value::Null,
    };
    let balance = match account.balance {
        Some(b) => Value::String(b.to_string()),
        None => Value::Null,
    };
    Ok(json!({
        "id": account.id,
        "name": account.name,
        "kind": account.kind.as_str(),
        "parent_id": account.parent_id,
        "created_at": format_timestamp(account.created_at)?,
        "retired_at": retired_at,
        "balance": balance,
        "revision": account.revision,
    }))
}

/// Decodes an account stored under `key`.
pub fn decode_account(key: &str, doc: &Document) -> Result<Account, CodecError> {
    let obj = as_object(doc)?;
    let id = required_str(obj, "id")?;
    check_key(key, id)?;

    let kind_str = required_str(obj, "kind")?;
    let kind = AccountKind::from_str(kind_str).map_err(|reason| CodecError::InvalidField {
        field: "kind".to_string(),
        reason,
    })?;

    let retired_at = match optional_str(obj, "retired_at")? {
        Some(s) => Some(parse_timestamp("retired_at", s)?),
        None => None,
    };
    let balance = match optional_str(obj, "balance")? {
        Some(s) => Some(parse_decimal("balance", s)?),
        None => None,
    };

    Ok(Account {
        id: id.to_string(),
        name: required_str(obj, "name")?.to_string(),
        kind,
        parent_id: optional_str(obj, "parent_id")?.map(str::to_string),
        created_at: parse_timestamp("created_at", required_str(obj, "created_at")?)?,
        retired_at,
        balance,
        revision: required_u64(obj, REVISION_FIELD)?,
    })
}

pub fn encode_transaction(txn: &Transaction) -> Result<Document, CodecError> {
    let lines: Vec<Value> = txn
        .lines
        .iter()
        .map(|l| json!({ "account_id": l.account_id, "amount": l.amount.to_string() }))
        .collect();
    Ok(json!({
        "id": txn.id,
        "sequence": txn.sequence,
        "timestamp": format_timestamp(txn.timestamp)?,
        "description": txn.description,
        "currency": txn.currency,
        "lines": lines,
        "reverses": txn.reverses,
    }))
}

/// Decodes a transaction stored under `key`. Fields a driver adds to the
/// document (such as a commit status) are ignored.
pub fn decode_transaction(key: &str, doc: &Document) -> Result<Transaction, CodecError> {
    let obj = as_object(doc)?;
    let id = required_str(obj, "id")?;
    check_key(key, id)?;

    let raw_lines = obj
        .get("lines")
        .ok_or_else(|| CodecError::MissingField("lines".to_string()))?
        .as_array()
        .ok_or_else(|| CodecError::InvalidField {
            field: "lines".to_string(),
            reason: "expected an array".to_string(),
        })?;

    let mut lines = Vec::with_capacity(raw_lines.len());
    for (i, raw) in raw_lines.iter().enumerate() {
        let line = raw.as_object().ok_or_else(|| CodecError::InvalidField {
            field: format!("lines[{}]", i),
            reason: "expected an object".to_string(),
        })?;
        let account_id = required_str(line, "account_id")?;
        let amount = parse_decimal("amount", required_str(line, "amount")?)?;
        lines.push(Line::new(account_id, amount));
    }

    let currency = match optional_str(obj, "currency")? {
        Some(code) if !is_currency_code(code) => {
            return Err(CodecError::InvalidField {
                field: "currency".to_string(),
                reason: format!("'{}' is not a three-letter currency code", code),
            })
        }
        code => code.map(str::to_string),
    };

    Ok(Transaction {
        id: id.to_string(),
        sequence: required_u64(obj, "sequence")?,
        timestamp: parse_timestamp("timestamp", required_str(obj, "timestamp")?)?,
        description: required_str(obj, "description")?.to_string(),
        currency,
        lines,
        reverses: optional_str(obj, "reverses")?.map(str::to_string),
    })
}

fn as_object(doc: &Document) -> Result<&Map<String, Value>, CodecError> {
    doc.as_object().ok_or(CodecError::NotAnObject)
}

fn check_key(key: &str, id: &str) -> Result<(), CodecError> {
    if key != id {
        return Err(CodecError::IdMismatch {
            expected: key.to_string(),
            found: id.to_string(),
        });
    }
    Ok(())
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, CodecError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(CodecError::InvalidField {
            field: field.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(CodecError::MissingField(field.to_string())),
    }
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<Option<&'a str>, CodecError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(CodecError::InvalidField {
            field: field.to_string(),
            reason: "expected a string or null".to_string(),
        }),
    }
}

fn required_u64(obj: &Map<String, Value>, field: &str) -> Result<u64, CodecError> {
    match obj.get(field) {
        Some(v) => v.as_u64().ok_or_else(|| CodecError::InvalidField {
            field: field.to_string(),
            reason: "expected an unsigned integer".to_string(),
        }),
        None => Err(CodecError::MissingField(field.to_string())),
    }
}

fn parse_decimal(field: &str, s: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(s).map_err(|e| CodecError::InvalidField {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

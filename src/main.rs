use std::{process::ExitCode, str::FromStr, sync::Arc};

use clap::Parser;
use ledgerstore::{
    backend::open_store,
    config::{AccountCommand, CliArgs, Command, Config, PostArgs},
    logging, AccountKind, CancellationToken, LedgerError, LedgerStore, Line, ReconciliationWorker, TransactionDraft,
};
use prettytable::{row, Table};
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    logging::init(&config.logging);

    let store = match open_store(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "Failed to open ledger");
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let worker = match config.reconciliation_interval() {
        Some(interval) => match ReconciliationWorker::spawn(store.clone(), interval) {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("Error: failed to start reconciliation worker: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let result = run(&store, cli.command);
    if let Some(worker) = worker {
        worker.stop();
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(store: &LedgerStore, command: Command) -> Result<(), String> {
    match command {
        Command::Account(AccountCommand::Create { name, kind, parent }) => {
            let kind = AccountKind::from_str(&kind)?;
            let account = match parent {
                Some(parent) => store.create_sub_account(&name, kind, &parent),
                None => store.create_account(&name, kind),
            }
            .map_err(describe)?;
            println!("{}", account.id);
        }
        Command::Account(AccountCommand::Retire { id }) => {
            store.retire_account(&id).map_err(describe)?;
            println!("Account {} retired", id);
        }
        Command::Account(AccountCommand::List) => {
            let mut table = Table::new();
            table.add_row(row!["Id", "Name", "Kind", "Parent", "Created", "Retired"]);
            for account in store.list_accounts().map_err(describe)? {
                table.add_row(row![
                    account.id,
                    account.name,
                    account.kind,
                    account.parent_id.unwrap_or_default(),
                    timestamp(account.created_at),
                    account.retired_at.map(timestamp).unwrap_or_default()
                ]);
            }
            table.printstd();
        }
        Command::Post(args) => {
            let mut draft = TransactionDraft::new(args.description.as_str(), parse_lines(&args)?);
            draft.currency = args.currency;
            let txn = store.post_draft(&draft).map_err(describe)?;
            println!("{}", txn.id);
        }
        Command::Reverse { id, description } => {
            let txn = store
                .reverse_transaction(&id, description.as_deref())
                .map_err(describe)?;
            println!("{}", txn.id);
        }
        Command::Balance { account_id, rollup } => {
            let account = store.get_account(&account_id).map_err(describe)?;
            let balance = if rollup {
                store.get_rollup_balance(&account_id)
            } else {
                store.get_balance(&account_id)
            }
            .map_err(describe)?;
            let mut table = Table::new();
            table.add_row(row!["Account", "Kind", "Signed", "Natural"]);
            table.add_row(row![
                account.name,
                account.kind,
                balance,
                account.kind.natural_balance(balance)
            ]);
            table.printstd();
        }
        Command::Transactions { account, since } => {
            let since = since
                .map(|s| OffsetDateTime::parse(&s, &Rfc3339).map_err(|e| format!("invalid --since: {}", e)))
                .transpose()?;
            let mut table = Table::new();
            table.add_row(row!["Seq", "Timestamp", "Id", "Description", "Currency", "Account", "Amount"]);
            for txn in store.list_transactions(account.as_deref(), since).iter().map_err(describe)? {
                for (i, line) in txn.lines.iter().enumerate() {
                    if i == 0 {
                        table.add_row(row![
                            txn.sequence,
                            timestamp(txn.timestamp),
                            txn.id,
                            txn.description,
                            txn.currency.clone().unwrap_or_default(),
                            line.account_id,
                            line.amount
                        ]);
                    } else {
                        table.add_row(row!["", "", "", "", "", line.account_id, line.amount]);
                    }
                }
            }
            table.printstd();
        }
        Command::Audit => {
            let report = store.audit_ledger(&CancellationToken::new()).map_err(describe)?;
            println!(
                "Checked {} accounts and {} transactions",
                report.accounts_checked, report.transactions_checked
            );
            if report.is_clean() {
                println!("No violations");
            } else {
                let mut table = Table::new();
                table.add_row(row!["Violation"]);
                for v in &report.violations {
                    table.add_row(row![v]);
                }
                table.printstd();
                return Err(format!("{} violation(s) found", report.violations.len()));
            }
        }
        Command::Reconcile => {
            let report = store.reconcile(&CancellationToken::new()).map_err(describe)?;
            let mut table = Table::new();
            table.add_row(row!["Completed", "Discarded", "Rolled back", "Unresolved"]);
            table.add_row(row![
                report.completed,
                report.discarded,
                report.rolled_back,
                report.unresolved.join(", ")
            ]);
            table.printstd();
            if !report.unresolved.is_empty() {
                return Err("some interrupted commits need operator attention".to_string());
            }
        }
    }
    Ok(())
}

fn parse_lines(args: &PostArgs) -> Result<Vec<Line>, String> {
    args.lines
        .iter()
        .map(|raw| {
            let (account_id, amount) = raw
                .split_once('=')
                .ok_or_else(|| format!("line '{}' is not ACCOUNT_ID=AMOUNT", raw))?;
            let amount = Decimal::from_str(amount.trim()).map_err(|e| format!("line '{}': {}", raw, e))?;
            Ok(Line::new(account_id.trim(), amount))
        })
        .collect()
}

fn timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

fn describe(e: LedgerError) -> String {
    e.to_string()
}

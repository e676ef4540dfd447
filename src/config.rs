use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::store::LedgerOptions;

#[derive(Parser, Debug)]
#[command(name = "ledgerstore", about = "LedgerStore - double-entry ledger over pluggable storage")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "ledgerstore.toml")]
    pub config: String,

    /// Storage backend (overrides config file)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Data directory or document store location (overrides config file)
    #[arg(short, long)]
    pub data_path: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage accounts
    #[command(subcommand)]
    Account(AccountCommand),
    /// Post a balanced transaction
    Post(PostArgs),
    /// Post the reversal of a committed transaction
    Reverse {
        id: String,
        #[arg(short = 'm', long)]
        description: Option<String>,
    },
    /// Show an account balance
    Balance {
        account_id: String,
        /// Include every account grouped under this one
        #[arg(short, long)]
        rollup: bool,
    },
    /// List transactions in timestamp order
    Transactions {
        #[arg(short, long)]
        account: Option<String>,
        /// RFC 3339 timestamp
        #[arg(short, long)]
        since: Option<String>,
    },
    /// Check every ledger invariant without modifying data
    Audit,
    /// Resolve interrupted commits older than the grace period
    Reconcile,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    Create {
        name: String,
        kind: String,
        /// Group the new account under this account id
        #[arg(short, long)]
        parent: Option<String>,
    },
    Retire { id: String },
    List,
}

#[derive(Args, Debug)]
pub struct PostArgs {
    #[arg(short = 'm', long)]
    pub description: String,

    /// Three-letter currency tag, such as USD
    #[arg(long)]
    pub currency: Option<String>,

    /// `ACCOUNT_ID=AMOUNT`, debit positive and credit negative
    #[arg(short = 'L', long = "line", required = true)]
    pub lines: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    File,
    DocumentStore,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Root directory for `file`; for `document_store` either `memory:` or
    /// a SQLite database path, optionally prefixed with `sqlite://`.
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default)]
    pub unique_account_names: bool,

    #[serde(default)]
    pub cache_balances: bool,

    #[serde(default = "default_grace_period_secs")]
    pub reconciliation_grace_period_secs: u64,

    /// 0 disables the background reconciliation worker.
    #[serde(default)]
    pub reconciliation_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_data_path() -> String {
    "./ledger-data".to_string()
}

fn default_grace_period_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: default_backend(),
            data_path: default_data_path(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            unique_account_names: false,
            cache_balances: false,
            reconciliation_grace_period_secs: default_grace_period_secs(),
            reconciliation_interval_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Config::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(backend) = cli.backend {
            config.storage.backend = backend;
        }
        if let Some(ref path) = cli.data_path {
            config.storage.data_path = path.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            unique_account_names: self.ledger.unique_account_names,
            cache_balances: self.ledger.cache_balances,
            reconciliation_grace_period: self.grace_period(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.ledger.reconciliation_grace_period_secs)
    }

    pub fn reconciliation_interval(&self) -> Option<Duration> {
        match self.ledger.reconciliation_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

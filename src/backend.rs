use std::{sync::Arc, time::Duration};

use ledgerstore_core::BackendDriver;
use ledgerstore_docstore::{DocumentStore, DocumentStoreDriver, MemoryDocumentStore, SqliteDocumentStore};
use ledgerstore_file::FileTreeDriver;

use crate::{
    config::{BackendKind, Config, StorageConfig},
    error::LedgerResult,
    store::LedgerStore,
};

pub const MEMORY_PATH: &str = "memory:";
const SQLITE_PREFIX: &str = "sqlite://";

/// Opens the configured backend. The file driver recovers interrupted
/// commits before returning.
pub fn open_driver(config: &StorageConfig, grace_period: Duration) -> LedgerResult<Arc<dyn BackendDriver>> {
    let driver: Arc<dyn BackendDriver> = match config.backend {
        BackendKind::File => Arc::new(FileTreeDriver::open(&config.data_path)?),
        BackendKind::DocumentStore => {
            let store: Arc<dyn DocumentStore> = if config.data_path == MEMORY_PATH {
                Arc::new(MemoryDocumentStore::new())
            } else {
                let path = config
                    .data_path
                    .strip_prefix(SQLITE_PREFIX)
                    .unwrap_or(&config.data_path);
                Arc::new(SqliteDocumentStore::new(path)?)
            };
            Arc::new(DocumentStoreDriver::new(store, grace_period))
        }
    };
    tracing::info!(backend = driver.name(), data_path = %config.data_path, "Storage backend opened");
    Ok(driver)
}

/// Builds a store from a loaded configuration.
pub fn open_store(config: &Config) -> LedgerResult<LedgerStore> {
    let driver = open_driver(&config.storage, config.grace_period())?;
    Ok(LedgerStore::new(driver, config.ledger_options()))
}

//! Document-store storage backend for LedgerStore.
//!
//! Accounts and transactions live as one document each in the `accounts`
//! and `transactions` collections. The underlying store only guarantees
//! that a single document write is atomic, so multi-document commits go
//! through a pending/committed marker on the transaction document (see
//! [`DocumentStoreDriver`]).

pub mod driver;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use driver::DocumentStoreDriver;
pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;
pub use store::DocumentStore;

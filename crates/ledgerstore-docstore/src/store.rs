use ledgerstore_core::{Document, StorageResult};

/// A Mongo-like store of JSON documents grouped into collections.
///
/// Each call is atomic for the single document it touches and nothing
/// more; there are no multi-document transactions.
pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Document>>;

    /// Stores a new document, failing with `AlreadyExists` if the id is taken.
    fn insert(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()>;

    /// Inserts or replaces a document.
    fn put(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()>;

    fn delete(&self, collection: &str, id: &str) -> StorageResult<bool>;

    /// All documents of a collection, ordered by id.
    fn find_all(&self, collection: &str) -> StorageResult<Vec<(String, Document)>>;

    /// Documents whose top-level string `field` equals `value`, ordered by id.
    fn find_eq(&self, collection: &str, field: &str, value: &str) -> StorageResult<Vec<(String, Document)>>;
}

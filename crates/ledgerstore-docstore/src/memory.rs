use std::{
    collections::BTreeMap,
    sync::{Mutex, RwLock},
};

use ledgerstore_core::{Document, StorageError, StorageResult};

use crate::store::DocumentStore;

/// In-process document store. Used for tests and for simulating a store
/// that starts failing part-way through a commit.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Document>>>,
    write_budget: Mutex<Option<usize>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the next `n` writes succeed and fails every write after that
    /// until [`clear_faults`](Self::clear_faults) is called.
    pub fn fail_writes_after(&self, n: usize) {
        *self.write_budget.lock().unwrap() = Some(n);
    }

    pub fn clear_faults(&self) {
        *self.write_budget.lock().unwrap() = None;
    }

    fn charge_write(&self) -> StorageResult<()> {
        let mut budget = self.write_budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => Err(StorageError::Other("injected write failure".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Document>> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    fn insert(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()> {
        self.charge_write()?;
        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StorageError::AlreadyExists(format!("{}/{}", collection, id)));
        }
        docs.insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn put(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()> {
        self.charge_write()?;
        let mut collections = self.collections.write().unwrap();
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        self.charge_write()?;
        let mut collections = self.collections.write().unwrap();
        Ok(collections
            .get_mut(collection)
            .map_or(false, |c| c.remove(id).is_some()))
    }

    fn find_all(&self, collection: &str) -> StorageResult<Vec<(String, Document)>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn find_eq(&self, collection: &str, field: &str, value: &str) -> StorageResult<Vec<(String, Document)>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, doc)| doc.get(field).and_then(|v| v.as_str()) == Some(value))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

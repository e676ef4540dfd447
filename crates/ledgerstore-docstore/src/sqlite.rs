use std::sync::Mutex;

use ledgerstore_core::{Document, StorageError, StorageResult};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::store::DocumentStore;

/// Document store kept in a single SQLite table, one JSON body per row.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql_err)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn parse_body(id: &str, body: &str) -> StorageResult<Document> {
    serde_json::from_str(body).map_err(|e| StorageError::Corruption(format!("document {}: {}", id, e)))
}

fn collect_rows(rows: Vec<(String, String)>) -> StorageResult<Vec<(String, Document)>> {
    rows.into_iter()
        .map(|(id, body)| {
            let doc = parse_body(&id, &body)?;
            Ok((id, doc))
        })
        .collect()
}

impl DocumentStore for SqliteDocumentStore {
    fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Document>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        body.map(|b| parse_body(id, &b)).transpose()
    }

    fn insert(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(doc)?;
        conn.execute(
            "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, id, body],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::ConstraintViolation => {
                StorageError::AlreadyExists(format!("{}/{}", collection, id))
            }
            _ => sql_err(e),
        })?;
        Ok(())
    }

    fn put(&self, collection: &str, id: &str, doc: &Document) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(doc)?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, id, body],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    fn find_all(&self, collection: &str) -> StorageResult<Vec<(String, Document)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql_err)?
            .collect::<Result<Vec<(String, String)>, _>>()
            .map_err(sql_err)?;
        collect_rows(rows)
    }

    fn find_eq(&self, collection: &str, field: &str, value: &str) -> StorageResult<Vec<(String, Document)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, body FROM documents
                 WHERE collection = ?1 AND json_extract(body, ?2) = ?3
                 ORDER BY id",
            )
            .map_err(sql_err)?;
        let path = format!("$.{}", field);
        let rows = stmt
            .query_map(params![collection, path, value], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql_err)?
            .collect::<Result<Vec<(String, String)>, _>>()
            .map_err(sql_err)?;
        collect_rows(rows)
    }
}

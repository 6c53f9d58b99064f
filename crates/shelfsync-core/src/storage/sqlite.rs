//! SQLite-backed record storage

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use super::Storage;

/// Durable storage in a single SQLite database
///
/// Every `append` and `write_all` runs in its own transaction, so a crash
/// mid-write leaves the previous records intact.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        if needs_init(&conn) {
            debug!("Initializing storage schema");
            init_schema(&conn)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Size of the database file in bytes
    pub fn size_bytes(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn decode(namespace: &str, body: &str) -> StorageResult<Value> {
        serde_json::from_str(body).map_err(|e| StorageError::CorruptRecord {
            namespace: namespace.to_string(),
            details: e.to_string(),
        })
    }
}

impl Storage for SqliteStorage {
    fn read_all(&self, namespace: &str) -> StorageResult<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT body FROM records WHERE namespace = ?1 ORDER BY seq")?;
        let bodies = stmt
            .query_map([namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| Self::decode(namespace, body))
            .collect()
    }

    fn write_all(&self, namespace: &str, records: &[Value]) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records WHERE namespace = ?1", [namespace])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO records (namespace, body) VALUES (?1, ?2)")?;
            for record in records {
                insert.execute(params![namespace, serde_json::to_string(record)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn append(&self, namespace: &str, record: &Value) -> StorageResult<()> {
        let body = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (namespace, body) VALUES (?1, ?2)",
            params![namespace, body],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_in_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.append("queue", &json!({"n": 1})).unwrap();
        storage.append("queue", &json!({"n": 2})).unwrap();
        storage.append("other", &json!({"n": 99})).unwrap();

        let records = storage.read_all("queue").unwrap();
        assert_eq!(records, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_write_all_replaces_namespace_only() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.append("queue", &json!(1)).unwrap();
        storage.append("other", &json!(2)).unwrap();

        storage.write_all("queue", &[json!(3), json!(4)]).unwrap();

        assert_eq!(storage.read_all("queue").unwrap(), vec![json!(3), json!(4)]);
        assert_eq!(storage.read_all("other").unwrap(), vec![json!(2)]);
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shelfsync.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.append("queue", &json!({"id": "a"})).unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.read_all("queue").unwrap(), vec![json!({"id": "a"})]);
        assert!(storage.size_bytes() > 0);
    }

    #[test]
    fn test_empty_namespace() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.read_all("missing").unwrap().is_empty());
    }
}

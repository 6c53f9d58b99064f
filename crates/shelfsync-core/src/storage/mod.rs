//! Storage layer
//!
//! Durable local storage for the mutation queue and the entity stores.
//!
//! ## Architecture
//!
//! - **Storage trait**: namespaced, ordered lists of JSON records with
//!   `read_all`, `write_all` and `append`. Each call is atomic.
//! - **SqliteStorage**: the on-disk backend (one row per record)
//! - **MemoryStorage**: in-process backend for tests and ephemeral sessions
//!
//! Higher layers never rewrite records in place; they append journal
//! entries and periodically compact with a single `write_all`.

mod atomic;
pub mod error;
pub mod journal;
mod memory;
pub mod schema;
mod sqlite;

use serde_json::Value;

pub(crate) use atomic::atomic_write;
pub use error::{StorageError, StorageResult};
pub use journal::{Journal, JournalEntry};
pub use memory::MemoryStorage;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteStorage;

/// Durable, namespaced record storage
///
/// Implementations must survive a process restart and must apply each
/// `append` or `write_all` entirely or not at all.
pub trait Storage: Send + Sync {
    /// Read every record of a namespace in append order
    fn read_all(&self, namespace: &str) -> StorageResult<Vec<Value>>;

    /// Replace the whole namespace with `records`
    fn write_all(&self, namespace: &str, records: &[Value]) -> StorageResult<()>;

    /// Append one record to the end of a namespace
    fn append(&self, namespace: &str, record: &Value) -> StorageResult<()>;
}

//! SQLite schema for the durable journal store
//!
//! Every namespace (mutation queue, one per entity store) is an ordered list
//! of JSON records. Ordering is the insertion `seq`.

use rusqlite::{Connection, OptionalExtension, Result};

/// Version written to `schema_info` by `init_schema`
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Journal records, one row per appended entry
        CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            body TEXT NOT NULL
        );

        -- Reads always scan one namespace in seq order
        CREATE INDEX IF NOT EXISTS idx_records_namespace ON records(namespace, seq);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Version recorded in `schema_info`, if any
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.and_then(|v| v.parse().ok()))
}

/// True when the tables are missing or carry an older version
pub fn needs_init(conn: &Connection) -> bool {
    // A missing schema_info table makes the version query fail
    !matches!(get_schema_version(conn), Ok(Some(v)) if v >= SCHEMA_VERSION)
}

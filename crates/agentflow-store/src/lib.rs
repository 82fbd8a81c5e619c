//! SQLite-backed implementations of the agentflow storage traits.
//!
//! `SqliteCache` persists memoized node results across processes and
//! `SqliteRunStore` keeps run records and their event logs after the
//! coordinator has evicted them from memory. Both can share one database
//! file; each opens its own connection.

pub mod cache;
pub mod runs;

pub use cache::SqliteCache;
pub use runs::SqliteRunStore;

use std::path::Path;

use rusqlite::Connection;

use agentflow_core::error::{FlowError, Result};

/// Open (or create) a database file with WAL enabled.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FlowError::Database(format!("Failed to create db directory: {}", e))
        })?;
    }

    let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(|e| FlowError::Database(e.to_string()))?;
    Ok(conn)
}

pub(crate) fn parse_timestamp(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use agentflow_core::config::CacheConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::CacheBackend;
use agentflow_core::types::{CacheEntry, CacheSelector, CacheStats, Fingerprint};

use crate::{open_connection, parse_timestamp};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
        fingerprint TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_version INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        outputs TEXT NOT NULL,
        created_at TEXT NOT NULL,
        ttl_secs INTEGER,
        size_bytes INTEGER NOT NULL,
        last_access INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cache_access ON cache_entries(last_access);
    CREATE INDEX IF NOT EXISTS idx_cache_workflow ON cache_entries(workflow_id, workflow_version);";

const COLUMNS: &str =
    "fingerprint, workflow_id, workflow_version, node_id, outputs, created_at, ttl_secs, size_bytes";

/// Persistent cache backend.
///
/// Same contract as the in-memory cache: write-once per live fingerprint,
/// passive TTL expiry, and least-recently-used eviction against the entry and
/// byte budgets. Recency is a counter stored with each row, so it survives a
/// restart.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    max_entries: usize,
    max_bytes: usize,
    tick: AtomicU64,
    evictions: AtomicU64,
}

impl SqliteCache {
    pub fn open(path: &Path, config: &CacheConfig) -> Result<Self> {
        let conn = open_connection(path)?;
        let cache = Self::with_connection(conn, config)?;
        debug!(path = %path.display(), "SQLite cache opened");
        Ok(cache)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(config: &CacheConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: &CacheConfig) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let last: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(last_access), 0) FROM cache_entries",
                [],
                |row| row.get(0),
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            tick: AtomicU64::new(last.max(0) as u64),
            evictions: AtomicU64::new(0),
        })
    }

    fn next_tick(&self) -> i64 {
        (self.tick.fetch_add(1, Ordering::Relaxed) + 1) as i64
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let now = Utc::now();
        let expired: Vec<Fingerprint> = load_all(&conn)?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.fingerprint)
            .collect();
        for key in &expired {
            delete(&conn, key)?;
        }
        Ok(expired.len())
    }

    /// Evict least-recently-used rows until both budgets hold.
    fn enforce_budget(&self, conn: &Connection) -> Result<()> {
        loop {
            let (count, bytes): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            if count.max(0) as usize <= self.max_entries && bytes.max(0) as usize <= self.max_bytes
            {
                return Ok(());
            }

            let victim: Option<String> = conn
                .query_row(
                    "SELECT fingerprint FROM cache_entries ORDER BY last_access ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let Some(victim) = victim else {
                return Ok(());
            };
            delete(conn, &Fingerprint(victim.clone()))?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %victim, "Evicted cache entry");
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(CacheEntry, String)> {
    let outputs: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let ttl_secs: Option<i64> = row.get(6)?;
    let size_bytes: i64 = row.get(7)?;
    let entry = CacheEntry {
        fingerprint: Fingerprint(row.get(0)?),
        workflow_id: row.get(1)?,
        workflow_version: row.get(2)?,
        node_id: row.get(3)?,
        outputs: Default::default(),
        created_at: parse_timestamp(&created_at),
        ttl_secs: ttl_secs.map(|t| t.max(0) as u64),
        size_bytes: size_bytes.max(0) as usize,
    };
    Ok((entry, outputs))
}

fn decode(raw: (CacheEntry, String)) -> Result<CacheEntry> {
    let (mut entry, outputs) = raw;
    entry.outputs = serde_json::from_str(&outputs)?;
    Ok(entry)
}

fn load(conn: &Connection, key: &Fingerprint) -> Result<Option<CacheEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM cache_entries WHERE fingerprint = ?1", COLUMNS),
            params![key.0],
            row_to_entry,
        )
        .optional()
        .map_err(|e| FlowError::Database(e.to_string()))?;
    raw.map(decode).transpose()
}

fn load_all(conn: &Connection) -> Result<Vec<CacheEntry>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM cache_entries", COLUMNS))
        .map_err(|e| FlowError::Database(e.to_string()))?;
    let rows = stmt
        .query_map([], row_to_entry)
        .map_err(|e| FlowError::Database(e.to_string()))?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(decode(row.map_err(|e| FlowError::Database(e.to_string()))?)?);
    }
    Ok(entries)
}

fn delete(conn: &Connection, key: &Fingerprint) -> Result<usize> {
    conn.execute(
        "DELETE FROM cache_entries WHERE fingerprint = ?1",
        params![key.0],
    )
    .map_err(|e| FlowError::Database(e.to_string()))
}

impl CacheBackend for SqliteCache {
    fn get(&self, key: &Fingerprint) -> BoxFuture<'_, Result<Option<CacheEntry>>> {
        let key = key.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let Some(entry) = load(&conn, &key)? else {
                return Ok(None);
            };
            if entry.is_expired(Utc::now()) {
                delete(&conn, &key)?;
                return Ok(None);
            }
            conn.execute(
                "UPDATE cache_entries SET last_access = ?1 WHERE fingerprint = ?2",
                params![self.next_tick(), key.0],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(Some(entry))
        })
    }

    fn put(&self, entry: CacheEntry) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            if let Some(existing) = load(&conn, &entry.fingerprint)? {
                if !existing.is_expired(Utc::now()) {
                    return Ok(false);
                }
                delete(&conn, &entry.fingerprint)?;
            }

            if entry.size_bytes > self.max_bytes || self.max_entries == 0 {
                debug!(
                    fingerprint = %entry.fingerprint,
                    size_bytes = entry.size_bytes,
                    "Entry exceeds cache budget, not stored"
                );
                return Ok(false);
            }

            let outputs = serde_json::to_string(&entry.outputs)?;
            conn.execute(
                &format!(
                    "INSERT INTO cache_entries ({}, last_access)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    COLUMNS
                ),
                params![
                    entry.fingerprint.0,
                    entry.workflow_id,
                    entry.workflow_version,
                    entry.node_id,
                    outputs,
                    entry.created_at.to_rfc3339(),
                    entry.ttl_secs.map(|t| t.min(i64::MAX as u64) as i64),
                    entry.size_bytes as i64,
                    self.next_tick(),
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

            self.enforce_budget(&conn)?;
            Ok(true)
        })
    }

    fn invalidate(&self, selector: CacheSelector) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let removed = match &selector {
                CacheSelector::All => conn
                    .execute("DELETE FROM cache_entries", [])
                    .map_err(|e| FlowError::Database(e.to_string()))?,
                CacheSelector::Key(key) => delete(&conn, key)?,
                _ => {
                    let matched: Vec<Fingerprint> = load_all(&conn)?
                        .into_iter()
                        .filter(|e| selector.matches(e))
                        .map(|e| e.fingerprint)
                        .collect();
                    for key in &matched {
                        delete(&conn, key)?;
                    }
                    matched.len()
                }
            };
            debug!(selector = ?selector, removed, "Cache invalidated");
            Ok(removed)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<CacheStats>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let (entries, bytes): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(CacheStats {
                entries: entries.max(0) as usize,
                bytes: bytes.max(0) as usize,
                evictions: self.evictions.load(Ordering::Relaxed),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            ..CacheConfig::default()
        }
    }

    fn entry(key: &str, node: &str, ttl: Option<u64>) -> CacheEntry {
        let mut outputs = agentflow_core::types::Outputs::new();
        outputs.insert("result".into(), json!(format!("out-{}", node)));
        CacheEntry::new(Fingerprint(key.into()), "wf", 1, node, outputs, ttl)
    }

    #[tokio::test]
    async fn test_put_get() {
        let cache = SqliteCache::in_memory(&config(10)).unwrap();
        assert!(cache.put(entry("k1", "a", None)).await.unwrap());

        let hit = cache.get(&Fingerprint("k1".into())).await.unwrap().unwrap();
        assert_eq!(hit.node_id, "a");
        assert_eq!(hit.outputs["result"], json!("out-a"));
        assert!(cache.get(&Fingerprint("nope".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_once() {
        let cache = SqliteCache::in_memory(&config(10)).unwrap();
        assert!(cache.put(entry("k1", "a", None)).await.unwrap());
        assert!(!cache.put(entry("k1", "b", None)).await.unwrap());
        let hit = cache.get(&Fingerprint("k1".into())).await.unwrap().unwrap();
        assert_eq!(hit.node_id, "a");
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = SqliteCache::in_memory(&config(10)).unwrap();
        cache.put(entry("k1", "a", Some(0))).await.unwrap();
        assert!(cache.get(&Fingerprint("k1".into())).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().entries, 0);

        // An expired slot can be rewritten.
        cache.put(entry("k2", "b", Some(0))).await.unwrap();
        assert!(cache.put(entry("k2", "c", None)).await.unwrap());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = SqliteCache::in_memory(&config(2)).unwrap();
        cache.put(entry("k1", "a", None)).await.unwrap();
        cache.put(entry("k2", "b", None)).await.unwrap();
        cache.get(&Fingerprint("k1".into())).await.unwrap();
        cache.put(entry("k3", "c", None)).await.unwrap();

        assert!(cache.get(&Fingerprint("k1".into())).await.unwrap().is_some());
        assert!(cache.get(&Fingerprint("k2".into())).await.unwrap().is_none());
        assert!(cache.get(&Fingerprint("k3".into())).await.unwrap().is_some());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_selectors() {
        let cache = SqliteCache::in_memory(&config(10)).unwrap();
        cache.put(entry("k1", "a", None)).await.unwrap();
        cache.put(entry("k2", "b", None)).await.unwrap();
        cache.put(entry("k3", "b", None)).await.unwrap();

        let removed = cache
            .invalidate(CacheSelector::Node {
                node_id: "b".into(),
                workflow_id: None,
            })
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed = cache
            .invalidate(CacheSelector::Key(Fingerprint("k1".into())))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = SqliteCache::open(&path, &config(10)).unwrap();
            cache.put(entry("k1", "a", None)).await.unwrap();
            cache.put(entry("k2", "b", Some(0))).await.unwrap();
        }

        let cache = SqliteCache::open(&path, &config(10)).unwrap();
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.get(&Fingerprint("k1".into())).await.unwrap().is_some());
    }
}

//! Result cache with LRU eviction and TTL expiration.
//!
//! `MemoryCache` is the in-process `CacheBackend`: entries are keyed by
//! fingerprint, written at most once while live, expire passively after their
//! TTL and are evicted least-recently-used first when either the entry or the
//! byte budget is exceeded.
//!
//! `ResultCache` is what the scheduler talks to. It wraps any backend and
//! turns backend errors into misses so an unavailable cache only costs
//! performance, never correctness.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use agentflow_core::config::CacheConfig;
use agentflow_core::error::Result;
use agentflow_core::traits::CacheBackend;
use agentflow_core::types::{CacheEntry, CacheSelector, CacheStats, Fingerprint};

/// In-memory cache backend.
pub struct MemoryCache {
    max_entries: usize,
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Fingerprint, Slot>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    bytes: usize,
    evictions: u64,
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &Fingerprint) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    fn touch(&mut self, key: &Fingerprint) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(slot) = self.entries.remove(&key) {
            self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
            self.evictions += 1;
            debug!(fingerprint = %key, "Evicted cache entry");
        }
        true
    }
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_bytes)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &Fingerprint) -> BoxFuture<'_, Result<Option<CacheEntry>>> {
        let key = key.clone();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let expired = match inner.entries.get(&key) {
                None => return Ok(None),
                Some(slot) => slot.entry.is_expired(Utc::now()),
            };
            if expired {
                inner.remove(&key);
                return Ok(None);
            }
            inner.touch(&key);
            Ok(inner.entries.get(&key).map(|slot| slot.entry.clone()))
        })
    }

    fn put(&self, entry: CacheEntry) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let now = Utc::now();

            if let Some(slot) = inner.entries.get(&entry.fingerprint) {
                if !slot.entry.is_expired(now) {
                    return Ok(false);
                }
                let key = entry.fingerprint.clone();
                inner.remove(&key);
            }

            if entry.size_bytes > self.max_bytes || self.max_entries == 0 {
                debug!(
                    fingerprint = %entry.fingerprint,
                    size_bytes = entry.size_bytes,
                    "Entry exceeds cache budget, not stored"
                );
                return Ok(false);
            }

            let key = entry.fingerprint.clone();
            let tick = inner.next_tick();
            inner.bytes += entry.size_bytes;
            inner.recency.insert(tick, key.clone());
            inner.entries.insert(key, Slot { entry, tick });

            while inner.entries.len() > self.max_entries || inner.bytes > self.max_bytes {
                if !inner.evict_lru() {
                    break;
                }
            }
            Ok(true)
        })
    }

    fn invalidate(&self, selector: CacheSelector) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let matched: Vec<Fingerprint> = inner
                .entries
                .iter()
                .filter(|(_, slot)| selector.matches(&slot.entry))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &matched {
                inner.remove(key);
            }
            debug!(selector = ?selector, removed = matched.len(), "Cache invalidated");
            Ok(matched.len())
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<CacheStats>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(CacheStats {
                entries: inner.entries.len(),
                bytes: inner.bytes,
                evictions: inner.evictions,
            })
        })
    }
}

/// Outcome of a cache lookup from the scheduler's point of view.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    /// The backend failed; treated as a miss.
    Unavailable,
}

/// Scheduler-facing cache facade.
#[derive(Clone)]
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    default_ttl_secs: Option<u64>,
    version_scoped: bool,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend: if config.enabled { Some(backend) } else { None },
            default_ttl_secs: config.default_ttl_secs,
            version_scoped: config.version_scoped,
        }
    }

    /// A cache that never hits; every node executes.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            default_ttl_secs: None,
            version_scoped: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn version_scoped(&self) -> bool {
        self.version_scoped
    }

    pub fn default_ttl_secs(&self) -> Option<u64> {
        self.default_ttl_secs
    }

    pub async fn lookup(&self, key: &Fingerprint) -> CacheLookup {
        let Some(backend) = &self.backend else {
            return CacheLookup::Miss;
        };
        match backend.get(key).await {
            Ok(Some(entry)) => CacheLookup::Hit(entry),
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                warn!(fingerprint = %key, error = %e, "Cache lookup failed, executing node");
                CacheLookup::Unavailable
            }
        }
    }

    /// Store a fresh result. Returns true if this call wrote the entry.
    pub async fn store(&self, entry: CacheEntry) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let key = entry.fingerprint.clone();
        match backend.put(entry).await {
            Ok(written) => written,
            Err(e) => {
                warn!(fingerprint = %key, error = %e, "Cache write failed");
                false
            }
        }
    }

    pub async fn invalidate(&self, selector: CacheSelector) -> Result<usize> {
        match &self.backend {
            Some(backend) => backend.invalidate(selector).await,
            None => Ok(0),
        }
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        match &self.backend {
            Some(backend) => backend.stats().await,
            None => Ok(CacheStats::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::Outputs;
    use agentflow_test_utils::OfflineCache;
    use serde_json::json;

    fn entry(key: &str, ttl: Option<u64>) -> CacheEntry {
        let mut outputs = Outputs::new();
        outputs.insert("out".into(), json!(key));
        CacheEntry::new(Fingerprint(key.into()), "wf", 1, key, outputs, ttl)
    }

    #[tokio::test]
    async fn test_put_get() {
        let cache = MemoryCache::new(10, 1 << 20);
        assert!(cache.put(entry("a", None)).await.unwrap());
        let hit = cache.get(&Fingerprint("a".into())).await.unwrap().unwrap();
        assert_eq!(hit.outputs["out"], json!("a"));
        assert!(cache.get(&Fingerprint("b".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_written_once_while_live() {
        let cache = MemoryCache::new(10, 1 << 20);
        assert!(cache.put(entry("a", None)).await.unwrap());

        let mut other = entry("a", None);
        other.outputs.insert("out".into(), json!("second"));
        assert!(!cache.put(other).await.unwrap());

        let hit = cache.get(&Fingerprint("a".into())).await.unwrap().unwrap();
        assert_eq!(hit.outputs["out"], json!("a"));
    }

    #[tokio::test]
    async fn test_lru_eviction_by_entries() {
        let cache = MemoryCache::new(2, 1 << 20);
        cache.put(entry("a", None)).await.unwrap();
        cache.put(entry("b", None)).await.unwrap();
        // Touch "a" so "b" becomes least recently used.
        cache.get(&Fingerprint("a".into())).await.unwrap();
        cache.put(entry("c", None)).await.unwrap();

        assert!(cache.get(&Fingerprint("a".into())).await.unwrap().is_some());
        assert!(cache.get(&Fingerprint("b".into())).await.unwrap().is_none());
        assert!(cache.get(&Fingerprint("c".into())).await.unwrap().is_some());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_byte_budget() {
        let one = entry("a", None).size_bytes;
        let cache = MemoryCache::new(100, one * 2);
        cache.put(entry("a", None)).await.unwrap();
        cache.put(entry("b", None)).await.unwrap();
        cache.put(entry("c", None)).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.bytes <= one * 2);
        assert!(cache.get(&Fingerprint("a".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_is_not_stored() {
        let cache = MemoryCache::new(10, 4);
        assert!(!cache.put(entry("a", None)).await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new(10, 1 << 20);
        let mut stale = entry("a", Some(60));
        stale.created_at = Utc::now() - chrono::Duration::seconds(120);
        cache.put(stale).await.unwrap();
        assert!(cache.get(&Fingerprint("a".into())).await.unwrap().is_none());
        assert_eq!(cache.len().await, 0);

        // An expired entry does not block a fresh write.
        let mut stale = entry("b", Some(60));
        stale.created_at = Utc::now() - chrono::Duration::seconds(120);
        cache.put(stale).await.unwrap();
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.put(entry("b", Some(60))).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_by_selector() {
        let cache = MemoryCache::new(10, 1 << 20);
        cache.put(entry("a", None)).await.unwrap();
        cache.put(entry("b", None)).await.unwrap();
        let mut v2 = entry("c", None);
        v2.workflow_version = 2;
        cache.put(v2).await.unwrap();

        let removed = cache
            .invalidate(CacheSelector::Workflow {
                workflow_id: "wf".into(),
                version: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);

        let removed = cache
            .invalidate(CacheSelector::Key(Fingerprint("c".into())))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_result_cache_degrades_on_backend_failure() {
        let cache = ResultCache::new(Arc::new(OfflineCache), &CacheConfig::default());
        assert!(matches!(
            cache.lookup(&Fingerprint("a".into())).await,
            CacheLookup::Unavailable
        ));
        assert!(!cache.store(entry("a", None)).await);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let backend = Arc::new(MemoryCache::default());
        backend.put(entry("a", None)).await.unwrap();
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = ResultCache::new(backend, &config);
        assert!(!cache.is_enabled());
        assert!(matches!(
            cache.lookup(&Fingerprint("a".into())).await,
            CacheLookup::Miss
        ));
    }
}

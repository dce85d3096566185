//! Read-through cache for consent list queries
//!
//! Entries are keyed `(subject_id, page, limit)` and live for a fixed TTL.
//! Writers never merge: any successful create or update invalidates every
//! cached page for the affected subject synchronously before the operation
//! returns.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::ConsentPage;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
}

/// Bounded TTL cache with oldest-access eviction
pub struct TtlCache<K, V> {
    max_entries: usize,
    ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.created_at.elapsed() > self.ttl {
                entries.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_accessed = Instant::now();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        entries.remove(key).map(|e| e.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Cache key for one page of a subject's consents
pub type ConsentListKey = (Uuid, u32, u32);

/// Read-through cache over [`ConsentPage`] results, invalidated per subject
pub struct ConsentListCache {
    inner: TtlCache<ConsentListKey, ConsentPage>,
    /// Keys currently cached per subject, so subject-wide invalidation does
    /// not scan the whole cache
    subject_keys: RwLock<HashMap<Uuid, HashSet<ConsentListKey>>>,
}

impl ConsentListCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(max_entries, ttl),
            subject_keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, subject_id: Uuid, page: u32, limit: u32) -> Option<ConsentPage> {
        self.inner.get(&(subject_id, page, limit)).await
    }

    pub async fn insert(&self, subject_id: Uuid, page: u32, limit: u32, value: ConsentPage) {
        let key = (subject_id, page, limit);
        self.inner.insert(key, value).await;
        let mut subjects = self.subject_keys.write().await;
        subjects.entry(subject_id).or_default().insert(key);
    }

    /// Drop every cached page for a subject. Called synchronously by writers
    /// before their operation returns.
    pub async fn invalidate_subject(&self, subject_id: Uuid) {
        let keys = {
            let mut subjects = self.subject_keys.write().await;
            subjects.remove(&subject_id)
        };
        if let Some(keys) = keys {
            for key in keys {
                self.inner.remove(&key).await;
            }
            self.inner
                .stats
                .invalidations
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize) -> ConsentPage {
        ConsentPage {
            items: Vec::new(),
            total: n as u64,
        }
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<u32, u32> = TtlCache::new(8, Duration::from_millis(20));
        cache.insert(1, 10).await;
        assert_eq!(cache.get(&1).await, Some(10));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&1).await, None);
        assert_eq!(cache.stats().expirations(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_accessed() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 10).await;
        cache.insert(2, 20).await;
        // Touch 1 so 2 becomes the eviction candidate
        cache.get(&1).await;
        cache.insert(3, 30).await;

        assert_eq!(cache.get(&1).await, Some(10));
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn subject_invalidation_drops_all_pages() {
        let cache = ConsentListCache::new(32, Duration::from_secs(60));
        let subject = Uuid::new_v4();
        let other = Uuid::new_v4();

        cache.insert(subject, 1, 10, page(1)).await;
        cache.insert(subject, 2, 10, page(2)).await;
        cache.insert(other, 1, 10, page(3)).await;

        cache.invalidate_subject(subject).await;

        assert!(cache.get(subject, 1, 10).await.is_none());
        assert!(cache.get(subject, 2, 10).await.is_none());
        assert!(cache.get(other, 1, 10).await.is_some());
    }

    #[tokio::test]
    async fn invalidating_unknown_subject_is_noop() {
        let cache = ConsentListCache::new(32, Duration::from_secs(60));
        cache.invalidate_subject(Uuid::new_v4()).await;
        assert_eq!(cache.stats().invalidations(), 0);
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CacheError;

/// One cached value plus its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<V> {
    pub data: V,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl<V> CacheRecord<V> {
    pub fn new(data: V, now: DateTime<Utc>) -> Self {
        Self {
            data,
            created_at: now,
            accessed_at: now,
        }
    }

    /// True once the record has gone unread for longer than `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.accessed_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// Durable backing for a [`TtlCache`]. One record per key.
#[async_trait]
pub trait CacheStore<V>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<(String, CacheRecord<V>)>, CacheError>;

    async fn put(&self, key: &str, record: &CacheRecord<V>) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// Look-aside cache with a time-to-live measured from the last read.
///
/// Keys are used exactly as given: two locators that point at the same
/// resource are two different entries. Storage failures are logged and the
/// operation degrades to an in-memory one, so a broken disk only costs hits.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheRecord<V>>,
    store: Option<Arc<dyn CacheStore<V>>>,
    max_age: Duration,
    stats: CacheStats,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            store: None,
            max_age,
            stats: CacheStats::default(),
        }
    }

    pub fn with_store(max_age: Duration, store: Arc<dyn CacheStore<V>>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(max_age)
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Warms the in-memory index from the durable store.
    pub async fn load(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        match store.load_all().await {
            Ok(records) => {
                let loaded = records.len();
                for (key, record) in records {
                    self.entries.insert(key, record);
                }
                info!("📂 Loaded {} cached tracks", loaded);
                loaded
            }
            Err(e) => {
                warn!("Cache store could not be read, starting empty: {}", e);
                0
            }
        }
    }

    /// Returns the cached value and refreshes its access time.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Utc::now();

        let hit = match self.entries.get_mut(key) {
            Some(mut record) if !record.is_stale(now, self.max_age) => {
                record.accessed_at = now;
                Some(record.value().clone())
            }
            Some(_) => None,
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match hit {
            Some(record) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.persist(key, &record).await;
                Some(record.data)
            }
            None => {
                // Expired but not yet swept.
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                if self
                    .entries
                    .remove_if(key, |_, record| record.is_stale(now, self.max_age))
                    .is_some()
                {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.forget(key).await;
                }
                debug!("⏰ Cache entry expired: {}", key);
                None
            }
        }
    }

    /// Stores a value. Writing the same key again replaces the data but keeps
    /// the original creation time.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = Utc::now();

        let record = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheRecord::new(value.clone(), now));
            entry.data = value;
            entry.accessed_at = now;
            entry.value().clone()
        };

        self.persist(&key, &record).await;
    }

    /// Removes every entry not read within `max_age`. Returns how many went.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_stale(now, max_age))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            // A read may have refreshed the entry since the scan.
            if self
                .entries
                .remove_if(&key, |_, record| record.is_stale(now, max_age))
                .is_some()
            {
                self.forget(&key).await;
                removed += 1;
            }
        }

        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
        removed
    }

    pub async fn evict_expired(&self) -> usize {
        self.evict_older_than(self.max_age).await
    }

    /// Runs [`Self::evict_expired`] now and then every `period` until cancelled.
    pub fn spawn_eviction(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache eviction task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_expired().await;
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&self, key: &str, record: CacheRecord<V>) {
        self.entries.insert(key.to_string(), record);
    }

    #[cfg(test)]
    pub(crate) fn record(&self, key: &str) -> Option<CacheRecord<V>> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    async fn persist(&self, key: &str, record: &CacheRecord<V>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(key, record).await {
                warn!("Could not persist cache entry {}: {}", key, e);
            }
        }
    }

    async fn forget(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(key).await {
                warn!("Could not remove cache entry {}: {}", key, e);
            }
        }
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const HOUR: Duration = Duration::from_secs(3600);

    fn aged(data: &str, hours: i64) -> CacheRecord<String> {
        let then = Utc::now() - chrono::Duration::hours(hours);
        CacheRecord::new(data.to_string(), then)
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<String, CacheRecord<String>>>,
        broken: bool,
    }

    #[async_trait]
    impl CacheStore<String> for MemoryStore {
        async fn load_all(&self) -> Result<Vec<(String, CacheRecord<String>)>, CacheError> {
            if self.broken {
                return Err(std::io::Error::other("disk gone").into());
            }
            Ok(self
                .records
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn put(&self, key: &str, record: &CacheRecord<String>) -> Result<(), CacheError> {
            if self.broken {
                return Err(std::io::Error::other("disk gone").into());
            }
            self.records.lock().insert(key.to_string(), record.clone());
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<(), CacheError> {
            if self.broken {
                return Err(std::io::Error::other("disk gone").into());
            }
            self.records.lock().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_then_get_hits() {
        let cache = TtlCache::new(HOUR);
        cache.set("https://x/a", "a".to_string()).await;

        assert_eq!(cache.get("https://x/a").await, Some("a".to_string()));
        assert_eq!(cache.get("https://x/b").await, None);
        assert_eq!(cache.metrics().hits, 1);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[tokio::test]
    async fn keys_are_not_normalized() {
        let cache = TtlCache::new(HOUR);
        cache.set("https://youtu.be/abc", "a".to_string()).await;

        assert_eq!(
            cache.get("https://www.youtube.com/watch?v=abc").await,
            None
        );
    }

    #[tokio::test]
    async fn rewriting_a_key_keeps_created_at() {
        let cache = TtlCache::new(HOUR * 24);
        let old = aged("v1", 3);
        let created = old.created_at;
        cache.insert_record("k", old);

        cache.set("k", "v2".to_string()).await;

        let record = cache.record("k").unwrap();
        assert_eq!(record.data, "v2");
        assert_eq!(record.created_at, created);
        assert!(record.accessed_at > created);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn eviction_removes_entries_older_than_max_age() {
        let cache = TtlCache::new(HOUR * 48);
        cache.insert_record("old", aged("old", 5));
        cache.insert_record("fresh", aged("fresh", 1));

        let removed = cache.evict_older_than(HOUR * 4).await;

        assert_eq!(removed, 1);
        assert_eq!(cache.get("old").await, None);
        assert_eq!(cache.get("fresh").await, Some("fresh".to_string()));
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn reads_extend_the_lifetime() {
        let cache = TtlCache::new(HOUR * 48);
        cache.insert_record("k", aged("v", 5));

        // Touch it, then sweep with a bound that the original write exceeds.
        assert!(cache.get("k").await.is_some());
        assert_eq!(cache.evict_older_than(HOUR * 4).await, 0);
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_miss_before_the_sweep() {
        let cache = TtlCache::new(HOUR * 2);
        cache.insert_record("k", aged("v", 3));

        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn store_is_written_through_and_reloaded() {
        let store = Arc::new(MemoryStore::default());
        let cache = TtlCache::with_store(HOUR, store.clone() as Arc<dyn CacheStore<String>>);
        cache.set("k", "v".to_string()).await;
        assert!(store.records.lock().contains_key("k"));

        let reopened = TtlCache::with_store(HOUR, store.clone() as Arc<dyn CacheStore<String>>);
        assert_eq!(reopened.load().await, 1);
        assert_eq!(reopened.get("k").await, Some("v".to_string()));

        store.records.lock().get_mut("k").unwrap().accessed_at =
            Utc::now() - chrono::Duration::hours(2);
        reopened.insert_record("k", store.records.lock()["k"].clone());
        assert_eq!(reopened.evict_expired().await, 1);
        assert!(store.records.lock().is_empty());
    }

    #[tokio::test]
    async fn broken_store_degrades_to_memory() {
        let store = Arc::new(MemoryStore {
            broken: true,
            ..Default::default()
        });
        let cache = TtlCache::with_store(HOUR, store as Arc<dyn CacheStore<String>>);

        assert_eq!(cache.load().await, 0);
        cache.set("k", "v".to_string()).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_task_sweeps_on_start() {
        let cache = Arc::new(TtlCache::new(HOUR));
        cache.insert_record("old", aged("old", 2));
        let cancel = CancellationToken::new();

        let task = cache.clone().spawn_eviction(HOUR * 6, cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}

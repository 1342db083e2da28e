//! In-process cache with native per-entry expiry

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{CacheBackend, CacheResult};

/// Writes between sweeps of expired entries
const SWEEP_INTERVAL: u64 = 64;

/// Cache item with metadata
#[derive(Debug, Clone)]
pub struct CachedItem {
    pub data: String,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedItem {
    pub fn new(data: String, ttl: Duration) -> Self {
        Self {
            data,
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Map of live entries
///
/// Expired entries are dropped when read, and swept every
/// [`SWEEP_INTERVAL`] writes so keys nobody reads again do not pile up.
#[derive(Debug, Default)]
pub struct CacheStore {
    items: HashMap<String, CachedItem>,
    writes: u64,
}

impl CacheStore {
    pub fn get(&mut self, key: &str) -> Option<String> {
        let is_expired = self
            .items
            .get(key)
            .map(|item| item.is_expired())
            .unwrap_or(false);

        if is_expired {
            self.items.remove(key);
            return None;
        }

        self.items.get(key).map(|item| item.data.clone())
    }

    pub fn insert(&mut self, key: String, item: CachedItem) -> Option<CachedItem> {
        let previous = self.items.insert(key, item);
        self.writes += 1;
        if self.writes % SWEEP_INTERVAL == 0 {
            let cleaned = self.cleanup_expired();
            if cleaned > 0 {
                debug!("Cleaned up {} expired cache entries", cleaned);
            }
        }
        previous
    }

    pub fn remove(&mut self, key: &str) -> Option<CachedItem> {
        self.items.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn cleanup_expired(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| !item.is_expired());
        before - self.items.len()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    store: RwLock<CacheStore>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let result = self.store.write().await.get(key);
        trace!(key, hit = result.is_some(), "Memory cache lookup");
        Ok(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.store
            .write()
            .await
            .insert(key.to_string(), CachedItem::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.store.write().await.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }

    fn enforces_ttl(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_item_expiration() {
        let item = CachedItem::new("data".to_string(), Duration::from_secs(60));
        assert!(!item.is_expired());

        let mut expired_item = CachedItem::new("data".to_string(), Duration::from_secs(60));
        expired_item.cached_at = Instant::now() - Duration::from_secs(120);
        assert!(expired_item.is_expired());
    }

    #[test]
    fn test_store_drops_expired_on_get() {
        let mut store = CacheStore::default();
        let mut item = CachedItem::new("old".to_string(), Duration::from_secs(1));
        item.cached_at = Instant::now() - Duration::from_secs(5);
        store.insert("k".to_string(), item);

        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip_and_expiry() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_secs(60)).await.unwrap();
        cache.set("b", "2", Duration::from_millis(10)).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("b").await.unwrap(), None);

        assert_eq!(cache.len().await, 1);

        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[test]
    fn test_writes_sweep_unread_expired_entries() {
        let mut store = CacheStore::default();
        let mut item = CachedItem::new("old".to_string(), Duration::from_secs(1));
        item.cached_at = Instant::now() - Duration::from_secs(5);
        store.insert("never-read".to_string(), item);

        for i in 0..SWEEP_INTERVAL {
            store.insert(format!("k{i}"), CachedItem::new(i.to_string(), Duration::from_secs(60)));
        }

        assert_eq!(store.len(), SWEEP_INTERVAL as usize);
        assert_eq!(store.get("k0").as_deref(), Some("0"));
    }
}

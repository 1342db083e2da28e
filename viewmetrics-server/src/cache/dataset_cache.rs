//! Dataset-aware caching on top of a [`CacheBackend`]
//!
//! Each dataset is stored under `{namespace}:{dataset_id}` as an envelope
//! holding the write time, the TTL and the row-oriented record list:
//!
//! ```json
//! {"cached_at": "2024-05-01T10:00:00Z", "ttl_secs": 3600, "records": [{"category": "a"}]}
//! ```
//!
//! Reads check the envelope age for every backend, so a backend without
//! native expiry (the file cache) ages entries out exactly like redis does.
//! A bare record list without an envelope is accepted and treated as fresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use viewmetrics_shared::{CacheError, Dataset};

use super::{dataset_key, CacheBackend, CacheResult};

/// Counters for cache monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DatasetCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries found but older than their TTL
    pub stale: u64,
    /// Entries that could not be decoded
    pub corrupt: u64,
    pub read_errors: u64,
    pub writes: u64,
    pub write_failures: u64,
}

impl DatasetCacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses + self.stale + self.corrupt + self.read_errors
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Serialize)]
struct EntryRef<'a> {
    cached_at: DateTime<Utc>,
    ttl_secs: u64,
    records: &'a Dataset,
}

#[derive(Deserialize)]
struct StoredEntry {
    cached_at: DateTime<Utc>,
    ttl_secs: u64,
    records: Value,
}

enum Lookup {
    Hit(Dataset),
    Miss,
    Stale { age_secs: i64 },
}

/// Serializes datasets into a cache backend under namespaced keys
#[derive(Clone)]
pub struct DatasetCache {
    backend: Arc<dyn CacheBackend>,
    stats: Arc<RwLock<DatasetCacheStats>>,
}

impl DatasetCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            stats: Arc::new(RwLock::new(DatasetCacheStats::default())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Look up every id; any failure for one id only turns that id into a miss
    pub async fn get_data_dict(
        &self,
        namespace: &str,
        dataset_ids: &[String],
    ) -> HashMap<String, Option<Dataset>> {
        let mut result = HashMap::with_capacity(dataset_ids.len());
        for dataset_id in dataset_ids {
            let dataset = self.get(namespace, dataset_id).await;
            result.insert(dataset_id.clone(), dataset);
        }
        result
    }

    /// Look up one dataset; errors are logged and reported as a miss
    pub async fn get(&self, namespace: &str, dataset_id: &str) -> Option<Dataset> {
        let key = dataset_key(namespace, dataset_id);
        let outcome = self.lookup(&key).await;

        let mut stats = self.stats.write().await;
        match outcome {
            Ok(Lookup::Hit(dataset)) => {
                stats.hits += 1;
                debug!(key = %key, rows = dataset.len(), "Dataset cache hit");
                Some(dataset)
            }
            Ok(Lookup::Miss) => {
                stats.misses += 1;
                debug!(key = %key, "Dataset cache miss");
                None
            }
            Ok(Lookup::Stale { age_secs }) => {
                stats.stale += 1;
                debug!(key = %key, age_secs, "Dataset cache entry expired");
                None
            }
            Err(CacheError::Serialization(reason)) => {
                stats.corrupt += 1;
                warn!(key = %key, error = %reason, "Corrupt dataset cache entry treated as miss");
                None
            }
            Err(e) => {
                stats.read_errors += 1;
                warn!(key = %key, error = %e, "Dataset cache read failed, treating as miss");
                None
            }
        }
    }

    /// Look up one dataset without counting the lookup
    ///
    /// For re-reads of an id whose first lookup was already counted.
    pub async fn peek(&self, namespace: &str, dataset_id: &str) -> Option<Dataset> {
        match self.lookup(&dataset_key(namespace, dataset_id)).await {
            Ok(Lookup::Hit(dataset)) => Some(dataset),
            _ => None,
        }
    }

    async fn lookup(&self, key: &str) -> CacheResult<Lookup> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(Lookup::Miss);
        };

        let value: Value = serde_json::from_str(&raw)?;
        if value.is_array() {
            return Ok(Lookup::Hit(Dataset::from_records_value(&value)?));
        }

        let entry: StoredEntry = serde_json::from_value(value)?;
        let age_secs = (Utc::now() - entry.cached_at).num_seconds();
        if age_secs > i64::try_from(entry.ttl_secs).unwrap_or(i64::MAX) {
            return Ok(Lookup::Stale { age_secs });
        }

        Ok(Lookup::Hit(Dataset::from_records_value(&entry.records)?))
    }

    /// Write every dataset; the first failing write aborts the call
    ///
    /// Returns the number of entries written.
    pub async fn set_data_dict(
        &self,
        namespace: &str,
        datasets: &HashMap<String, Dataset>,
        ttl: Duration,
    ) -> CacheResult<usize> {
        let mut written = 0;
        for (dataset_id, dataset) in datasets {
            if let Err(e) = self.set(namespace, dataset_id, dataset, ttl).await {
                error!(
                    namespace,
                    dataset_id = %dataset_id,
                    written,
                    error = %e,
                    "Failed to cache dataset batch"
                );
                return Err(e);
            }
            written += 1;
        }

        info!(namespace, written, "Cached datasets");
        Ok(written)
    }

    /// Write one dataset
    pub async fn set(
        &self,
        namespace: &str,
        dataset_id: &str,
        dataset: &Dataset,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = dataset_key(namespace, dataset_id);
        let encoded = serde_json::to_string(&EntryRef {
            cached_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            records: dataset,
        });

        let result = match encoded {
            Ok(value) => self.backend.set(&key, &value, ttl).await,
            Err(e) => Err(e.into()),
        };

        let mut stats = self.stats.write().await;
        match &result {
            Ok(()) => stats.writes += 1,
            Err(_) => stats.write_failures += 1,
        }
        result
    }

    pub async fn get_stats(&self) -> DatasetCacheStats {
        self.stats.read().await.clone()
    }
}

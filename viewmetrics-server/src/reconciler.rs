//! Cache-first resolution of datasets with concurrent upstream fetches
//!
//! ```text
//! resolve(ids)
//!   ├── Dataset Cache read (every id)
//!   ├── misses ──> worker pool ──> per-id in-flight lock
//!   │                                ├── cache re-read (another caller may have filled it)
//!   │                                └── ViewSource::fetch_view ──> cache write
//!   └── hits + fetched ──> Resolution
//!
//! refresh_all(ids)
//!   └── every id ──> worker pool ──> per-id in-flight lock
//!                                    └── ViewSource::fetch_view ──> cache write
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use viewmetrics_shared::{CacheError, Dataset, FetchError, MetricsError, Result};
use viewmetrics_source::ViewSource;

use crate::cache::DatasetCache;
use crate::workers::WorkerPool;

/// Outcome of resolving a set of dataset ids
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    /// De-duplicated ids in request order
    pub requested: Vec<String>,
    /// Every id that resolved, from the cache or the source
    pub datasets: HashMap<String, Dataset>,
    /// Ids served by the first cache read
    pub cache_hits: Vec<String>,
    /// Ids fetched from the source by this call
    pub fetched: Vec<String>,
    /// Ids whose fetch failed; absent from `datasets`
    pub failed: Vec<FetchError>,
}

impl Resolution {
    /// True when nothing came from the cache, which signals a cold or broken cache
    pub fn is_degraded(&self) -> bool {
        !self.requested.is_empty() && self.cache_hits.is_empty()
    }

    /// Ids worth a background refresh after a degraded resolve
    ///
    /// Ids this call already fetched and cached are left out. Empty when the
    /// cache was not degraded or every miss was fetched.
    pub fn refresh_candidates(&self) -> Vec<String> {
        if !self.is_degraded() {
            return Vec::new();
        }
        if self.datasets.is_empty() {
            return self.requested.clone();
        }
        self.failed.iter().map(|e| e.view_id.clone()).collect()
    }
}

enum FetchOutcome {
    /// Filled by a concurrent caller while this one waited for the lock
    Cached(Dataset),
    Fetched(Dataset),
    Failed(FetchError),
    WriteFailed(CacheError),
}

#[derive(Clone)]
pub struct FetchReconciler {
    source: Arc<dyn ViewSource>,
    cache: DatasetCache,
    namespace: Arc<str>,
    ttl: Duration,
    pool: WorkerPool,
    inflight: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FetchReconciler {
    pub fn new(
        source: Arc<dyn ViewSource>,
        cache: DatasetCache,
        namespace: impl Into<String>,
        ttl: Duration,
        pool: WorkerPool,
    ) -> Self {
        Self {
            source,
            cache,
            namespace: Arc::from(namespace.into()),
            ttl,
            pool,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &DatasetCache {
        &self.cache
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve ids from the cache, fetching only the misses
    ///
    /// Fetch failures are contained: the id is left out of the result and
    /// listed in `failed`. A failed cache write aborts the call.
    pub async fn resolve(&self, dataset_ids: &[String]) -> Result<Resolution> {
        let requested = dedupe(dataset_ids);
        let mut cached = self.cache.get_data_dict(&self.namespace, &requested).await;

        let mut resolution = Resolution {
            requested: requested.clone(),
            ..Resolution::default()
        };
        let mut misses = Vec::new();
        for id in requested {
            match cached.remove(&id).flatten() {
                Some(dataset) => {
                    resolution.cache_hits.push(id.clone());
                    resolution.datasets.insert(id, dataset);
                }
                None => misses.push(id),
            }
        }

        debug!(
            hits = resolution.cache_hits.len(),
            misses = misses.len(),
            "Partitioned dataset ids"
        );

        if misses.is_empty() {
            return Ok(resolution);
        }

        let items = misses.into_iter().map(|id| (id, ())).collect();
        let outcomes = self
            .pool
            .run_keyed(items, |id, ()| {
                let this = self.clone();
                async move { this.fetch_missing(&id).await }
            })
            .await;

        let mut write_error = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(FetchOutcome::Cached(dataset)) => {
                    resolution.datasets.insert(id, dataset);
                }
                Ok(FetchOutcome::Fetched(dataset)) => {
                    resolution.fetched.push(id.clone());
                    resolution.datasets.insert(id, dataset);
                }
                Ok(FetchOutcome::Failed(e)) => {
                    warn!(dataset_id = %id, error = %e.reason, "View fetch failed, no data for this id");
                    resolution.failed.push(e);
                }
                Ok(FetchOutcome::WriteFailed(e)) => {
                    write_error.get_or_insert(e);
                }
                Err(failure) => {
                    warn!(dataset_id = %id, error = %failure, "Fetch task failed");
                    resolution.failed.push(FetchError::new(id, failure.to_string()));
                }
            }
        }

        if let Some(e) = write_error {
            return Err(MetricsError::Cache(e));
        }

        info!(
            requested = resolution.requested.len(),
            cache_hits = resolution.cache_hits.len(),
            fetched = resolution.fetched.len(),
            failed = resolution.failed.len(),
            namespace = %self.namespace,
            "Resolved datasets"
        );
        Ok(resolution)
    }

    /// Fetch one missing id unless a concurrent caller already did
    async fn fetch_missing(&self, dataset_id: &str) -> FetchOutcome {
        self.single_flight(dataset_id, true).await
    }

    /// Run one fetch of `dataset_id` while holding its in-flight lock
    ///
    /// With `reuse_cached` the cache is re-read under the lock first, so a
    /// caller that waited behind another fetch of the same id reuses its
    /// result. Without it the source is always called.
    async fn single_flight(&self, dataset_id: &str, reuse_cached: bool) -> FetchOutcome {
        let lock = {
            let mut map = self.inflight.lock().await;
            Arc::clone(
                map.entry(dataset_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = lock.lock().await;
        let outcome = if reuse_cached {
            match self.cache.peek(&self.namespace, dataset_id).await {
                Some(dataset) => {
                    debug!(dataset_id, "Dataset filled by concurrent fetch");
                    FetchOutcome::Cached(dataset)
                }
                None => self.fetch_and_store(dataset_id).await,
            }
        } else {
            self.fetch_and_store(dataset_id).await
        };
        drop(guard);

        self.release_inflight(dataset_id, &lock).await;
        outcome
    }

    async fn fetch_and_store(&self, dataset_id: &str) -> FetchOutcome {
        match self.source.fetch_view(dataset_id).await {
            Ok(dataset) => match self
                .cache
                .set(&self.namespace, dataset_id, &dataset, self.ttl)
                .await
            {
                Ok(()) => FetchOutcome::Fetched(dataset),
                Err(e) => FetchOutcome::WriteFailed(e),
            },
            Err(e) => FetchOutcome::Failed(e),
        }
    }

    async fn release_inflight(&self, dataset_id: &str, lock: &Arc<Mutex<()>>) {
        let mut map = self.inflight.lock().await;
        // Only the map and this caller hold it: nobody is waiting
        if Arc::strong_count(lock) == 2 {
            map.remove(dataset_id);
        }
    }

    /// Fetch every id from the source, bypassing cache reads, and write the successes
    ///
    /// Each id still goes through its in-flight lock, so a refresh never
    /// overlaps a request-path fetch of the same id. Fails if any fetch
    /// failed, after writing the ones that succeeded; a failed write fails
    /// the call.
    pub async fn refresh_all(&self, dataset_ids: &[String]) -> Result<usize> {
        let requested = dedupe(dataset_ids);
        if requested.is_empty() {
            return Ok(0);
        }

        let items = requested.into_iter().map(|id| (id, ())).collect();
        let outcomes = self
            .pool
            .run_keyed(items, |id, ()| {
                let this = self.clone();
                async move { this.single_flight(&id, false).await }
            })
            .await;

        let mut written = 0;
        let mut failures = Vec::new();
        let mut write_error = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(FetchOutcome::Fetched(_)) | Ok(FetchOutcome::Cached(_)) => written += 1,
                Ok(FetchOutcome::Failed(e)) => failures.push(e),
                Ok(FetchOutcome::WriteFailed(e)) => {
                    error!(dataset_id = %id, error = %e, "Failed to cache refreshed dataset");
                    write_error.get_or_insert(e);
                }
                Err(failure) => failures.push(FetchError::new(id, failure.to_string())),
            }
        }

        if let Some(e) = write_error {
            return Err(MetricsError::Cache(e));
        }
        info!(namespace = %self.namespace, written, "Cached datasets");

        if failures.is_empty() {
            return Ok(written);
        }

        let ids: Vec<&str> = failures.iter().map(|e| e.view_id.as_str()).collect();
        let reasons: Vec<&str> = failures.iter().map(|e| e.reason.as_str()).collect();
        Err(MetricsError::Fetch(FetchError::new(
            ids.join(","),
            format!(
                "{} of {} views failed: {}",
                failures.len(),
                failures.len() + written,
                reasons.join("; ")
            ),
        )))
    }
}

/// Drop repeated ids, keeping first occurrences in order
fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

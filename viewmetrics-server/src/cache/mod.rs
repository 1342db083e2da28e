//! Caching layer for fetched views
//!
//! ```text
//! DatasetCache                  <- namespaced keys, record codec, age check
//!   └── dyn CacheBackend         <- key -> string with per-key TTL
//!         CacheProvider (enum)   <- chosen once at startup
//!           ├── Redis(RedisCache)   native expiry, fail-fast construction
//!           ├── File(FileCache)     durable, no expiry of its own
//!           └── Memory(MemoryCache) in-process, native expiry
//! ```
//!
//! Backends only move strings. Expiry for backends that cannot expire keys
//! themselves is enforced one level up, in [`DatasetCache`], from the write
//! timestamp stored with every entry.

pub mod dataset_cache;
pub mod file_cache;
pub mod memory_cache;
pub mod redis_cache;

pub use dataset_cache::{DatasetCache, DatasetCacheStats};
pub use file_cache::FileCache;
pub use memory_cache::MemoryCache;
pub use redis_cache::RedisCache;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};
use viewmetrics_shared::{CacheBackendKind, CacheConfig, CacheError};

pub type CacheResult<T> = Result<T, CacheError>;

/// Key/value store with per-key TTL
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// `Ok(None)` on a miss
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn health_check(&self) -> CacheResult<bool>;

    fn provider_name(&self) -> &'static str;

    /// Whether entries disappear on their own once their TTL passes
    fn enforces_ttl(&self) -> bool;
}

/// Build the cache key for one dataset
pub fn dataset_key(namespace: &str, dataset_id: &str) -> String {
    format!("{namespace}:{dataset_id}")
}

/// Map a key onto characters that are safe in a file name
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-escaped, so distinct keys
/// always map to distinct names.
pub(crate) fn sanitize_key_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Cache backend selected from configuration
#[derive(Debug)]
pub enum CacheProvider {
    Redis(Box<RedisCache>),
    File(FileCache),
    Memory(MemoryCache),
}

impl CacheProvider {
    /// Construct the configured backend
    ///
    /// A redis backend that cannot be reached is replaced by the file backend
    /// when `fallback_to_file` is set; otherwise the connectivity error is
    /// returned to the caller.
    pub async fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let provider = match config.backend {
            CacheBackendKind::Redis => {
                let timeout = Duration::from_secs(config.connect_timeout_secs);
                match RedisCache::connect(&config.redis_url, timeout).await {
                    Ok(cache) => CacheProvider::Redis(Box::new(cache)),
                    Err(CacheError::Connectivity(reason)) if config.fallback_to_file => {
                        let dir = config.resolved_cache_dir();
                        warn!(
                            error = %reason,
                            cache_dir = %dir.display(),
                            "Redis unreachable, falling back to file cache"
                        );
                        CacheProvider::File(FileCache::new(dir)?)
                    }
                    Err(e) => return Err(e),
                }
            }
            CacheBackendKind::File => CacheProvider::File(FileCache::new(config.resolved_cache_dir())?),
            CacheBackendKind::Memory => CacheProvider::Memory(MemoryCache::new()),
        };

        info!(
            backend = provider.provider_name(),
            self_expiring = provider.enforces_ttl(),
            "Cache backend selected"
        );
        Ok(provider)
    }
}

#[async_trait]
impl CacheBackend for CacheProvider {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match self {
            Self::Redis(s) => s.get(key).await,
            Self::File(s) => s.get(key).await,
            Self::Memory(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        match self {
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::File(s) => s.set(key, value, ttl).await,
            Self::Memory(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match self {
            Self::Redis(s) => s.delete(key).await,
            Self::File(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        match self {
            Self::Redis(s) => s.health_check().await,
            Self::File(s) => s.health_check().await,
            Self::Memory(s) => s.health_check().await,
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(s) => s.provider_name(),
            Self::File(s) => s.provider_name(),
            Self::Memory(s) => s.provider_name(),
        }
    }

    fn enforces_ttl(&self) -> bool {
        match self {
            Self::Redis(s) => s.enforces_ttl(),
            Self::File(s) => s.enforces_ttl(),
            Self::Memory(s) => s.enforces_ttl(),
        }
    }
}

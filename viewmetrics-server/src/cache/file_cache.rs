//! File-backed cache: one file per key under a root directory
//!
//! Entries never expire here. The TTL passed to `set` is ignored; staleness
//! is judged by [`super::DatasetCache`] from the timestamp inside the value.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::{sanitize_key_component, CacheBackend, CacheResult};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open the cache, creating the root directory if it does not exist
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            info!(cache_dir = %root.display(), "Created cache directory");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key_component(key)))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            ".{}.{}.{}.tmp",
            sanitize_key_component(key),
            std::process::id(),
            n
        ))
    }
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match tokio::fs::read_to_string(self.entry_path(key)).await {
            Ok(content) => {
                debug!(key, "Cache HIT");
                Ok(Some(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "Cache MISS");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> CacheResult<()> {
        // Readers see either the old file or the complete new one
        let temp = self.temp_path(key);
        tokio::fs::write(&temp, value).await?;
        if let Err(e) = tokio::fs::rename(&temp, self.entry_path(key)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(key, bytes = value.len(), "Cache SET");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    fn provider_name(&self) -> &'static str {
        "file"
    }

    fn enforces_ttl(&self) -> bool {
        false
    }
}

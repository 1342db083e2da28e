//! Configuration management for the view metrics pipeline

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::MetricsError;

/// Main configuration for the metrics server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Upstream reporting service
    pub source: SourceConfig,

    /// Cache configuration
    pub cache: CacheConfig,

    /// View ids to resolve and aggregate
    pub views: Vec<String>,

    /// Category values offered to the presentation layer as filters
    pub available_filters: Vec<String>,

    /// Dataset fields used by the standard KPIs
    pub fields: FieldConfig,

    /// Fan-out limits
    pub workers: WorkerConfig,

    /// Background refresh configuration
    pub refresh: RefreshConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Upstream view source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Reporting service reachable over HTTP
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_source_timeout")]
        timeout_secs: u64,
    },
    /// One `<view_id>.json` record file per view
    Directory { path: String },
}

fn default_source_timeout() -> u64 {
    60
}

/// Which cache backend to construct at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Redis,
    File,
    Memory,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend to use
    pub backend: CacheBackendKind,

    /// Connection string for the redis backend
    pub redis_url: String,

    /// Seconds to wait for the redis backend before giving up
    pub connect_timeout_secs: u64,

    /// Construct the file backend when redis is unreachable
    pub fallback_to_file: bool,

    /// Root directory of the file backend (platform data dir when unset)
    pub cache_dir: Option<String>,

    /// Key prefix for every dataset entry
    pub namespace: String,

    /// Cache TTL in seconds
    pub ttl_secs: u64,
}

/// Field names consumed by the standard KPIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub category: String,
    pub date: String,
    pub value: String,
}

/// Fan-out limits for the two worker pools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent upstream fetches
    pub max_concurrent_fetches: usize,

    /// Concurrent dataset aggregations
    pub max_concurrent_aggregations: usize,
}

/// Background refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Total attempts per refresh job
    pub max_attempts: u32,

    /// Fixed delay between attempts (seconds)
    pub retry_delay_secs: u64,

    /// Scheduled refresh interval (seconds); no schedule when unset
    pub interval_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            cache: CacheConfig::default(),
            views: Vec::new(),
            available_filters: vec![
                "filter1".to_string(),
                "filter2".to_string(),
                "filter3".to_string(),
            ],
            fields: FieldConfig::default(),
            workers: WorkerConfig::default(),
            refresh: RefreshConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Http {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            timeout_secs: default_source_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            redis_url: "redis://localhost:6379/0".to_string(),
            connect_timeout_secs: 5,
            fallback_to_file: true,
            cache_dir: None,
            namespace: "viewmetrics".to_string(),
            ttl_secs: 3600, // 1 hour
        }
    }
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            category: "category".to_string(),
            date: "date".to_string(),
            value: "value".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            max_concurrent_aggregations: 4,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 60,
            interval_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CacheConfig {
    /// Root directory of the file backend
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("com", "pulseengine", "viewmetrics")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| std::env::temp_dir().join("viewmetrics-cache")),
        }
    }
}

impl MetricsConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&str>) -> crate::Result<Self> {
        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: MetricsConfig = serde_json::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &str) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache.namespace.trim().is_empty() {
            return Err(MetricsError::Config("cache.namespace must not be empty".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(MetricsError::Config("cache.ttl_secs must be positive".into()));
        }
        if self.workers.max_concurrent_fetches == 0 || self.workers.max_concurrent_aggregations == 0
        {
            return Err(MetricsError::Config(
                "worker concurrency limits must be at least 1".into(),
            ));
        }
        if self.refresh.max_attempts == 0 {
            return Err(MetricsError::Config("refresh.max_attempts must be at least 1".into()));
        }
        if self.refresh.interval_secs == Some(0) {
            return Err(MetricsError::Config("refresh.interval_secs must be positive".into()));
        }
        if let Some(view) = self.views.iter().find(|v| v.trim().is_empty()) {
            return Err(MetricsError::Config(format!("invalid view id '{view}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MetricsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.refresh.max_attempts, 3);
        assert_eq!(config.refresh.retry_delay_secs, 60);
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_str().unwrap();

        let mut config = MetricsConfig::default();
        config.views = vec!["v1".to_string(), "v2".to_string()];
        config.cache.backend = CacheBackendKind::File;
        config.source = SourceConfig::Directory {
            path: "/data/views".to_string(),
        };
        config.save(path).unwrap();

        let loaded = MetricsConfig::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.views, config.views);
        assert_eq!(loaded.cache.backend, CacheBackendKind::File);
        assert!(matches!(loaded.source, SourceConfig::Directory { .. }));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"views": ["v1"], "cache": {"backend": "memory"}}"#).unwrap();

        let loaded = MetricsConfig::load_or_default(path.to_str()).unwrap();
        assert_eq!(loaded.views, vec!["v1".to_string()]);
        assert_eq!(loaded.cache.backend, CacheBackendKind::Memory);
        assert_eq!(loaded.cache.ttl_secs, 3600);
        assert_eq!(loaded.fields.category, "category");
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = MetricsConfig::default();
        config.workers.max_concurrent_fetches = 0;
        assert!(matches!(config.validate(), Err(MetricsError::Config(_))));

        let mut config = MetricsConfig::default();
        config.refresh.max_attempts = 0;
        assert!(matches!(config.validate(), Err(MetricsError::Config(_))));
    }
}

//! Shared types and utilities for the view metrics pipeline

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    CacheBackendKind, CacheConfig, FieldConfig, LoggingConfig, MetricsConfig, RefreshConfig,
    SourceConfig, WorkerConfig,
};
pub use error::{AggregationError, CacheError, FetchError, MetricsError, Result};
pub use types::{Dataset, Scalar};

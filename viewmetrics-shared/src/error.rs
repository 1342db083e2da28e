//! Error types for the view metrics pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Failures raised by cache backends and the dataset codec
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend could not be reached; callers may fall back to another backend
    #[error("Cache connectivity error: {0}")]
    Connectivity(String),

    /// Stored value could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Upstream view fetch failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to fetch view '{view_id}': {reason}")]
pub struct FetchError {
    pub view_id: String,
    pub reason: String,
}

impl FetchError {
    pub fn new(view_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            view_id: view_id.into(),
            reason: reason.into(),
        }
    }
}

/// KPI computation failed for a single dataset
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Column '{column}' holds non-numeric value '{value}'")]
    NonNumeric { column: String, value: String },

    #[error("Worker task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("Background refresh gave up after {attempts} attempts: {last_error}")]
    TaskExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

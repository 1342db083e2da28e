//! Cache-coordinated fetch, aggregation and refresh of reporting views

pub mod aggregator;
pub mod cache;
pub mod kpi;
pub mod reconciler;
pub mod refresh;
pub mod service;
pub mod workers;

pub use aggregator::{AggregationResult, ParallelAggregator};
pub use cache::{CacheBackend, CacheProvider, DatasetCache, DatasetCacheStats};
pub use kpi::{pivot, value_counts, DatasetMetrics, PivotKey, PivotTable, Reducer, ValueCounts};
pub use reconciler::{FetchReconciler, Resolution};
pub use refresh::{JobFailure, JobId, JobStatus, RefreshQueue, RefreshTrigger, RetryPolicy};
pub use service::{MetricOutcome, MetricsReport, MetricsService};
pub use workers::{TaskFailure, WorkerPool};

//! The metrics service consumed by the presentation layer

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use viewmetrics_shared::{Dataset, MetricsConfig, Result};
use viewmetrics_source::ViewSource;

use crate::aggregator::ParallelAggregator;
use crate::cache::{CacheBackend, CacheProvider, DatasetCache, DatasetCacheStats};
use crate::kpi::{DatasetMetrics, PivotTable, ValueCounts};
use crate::reconciler::FetchReconciler;
use crate::refresh::{JobId, RefreshQueue, RefreshTrigger, RetryPolicy};
use crate::workers::WorkerPool;

pub const NO_DATA: &str = "No data";

/// What the presentation layer gets for one dataset id
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum MetricOutcome {
    Ready(DatasetMetrics),
    /// Not cached and could not be fetched, or the dataset has no rows
    NoData,
    /// The dataset resolved but its metrics could not be computed
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// One entry per requested id
    pub metrics: BTreeMap<String, MetricOutcome>,
    /// Category filter applied to every dataset, sorted
    pub filter: Vec<String>,
    pub available_filters: Vec<String>,
    /// Background refresh queued because nothing came from the cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_job: Option<JobId>,
}

impl MetricsReport {
    pub fn ready_count(&self) -> usize {
        self.metrics
            .values()
            .filter(|m| matches!(m, MetricOutcome::Ready(_)))
            .count()
    }

    /// Plain-text rendering; missing and failed entries print as "No data"
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if !self.filter.is_empty() {
            let _ = writeln!(out, "Filter: {}", self.filter.join(", "));
            let _ = writeln!(out);
        }

        for (id, outcome) in &self.metrics {
            let _ = writeln!(out, "== {id} ==");
            match outcome {
                MetricOutcome::Ready(metrics) => {
                    render_value_counts(&mut out, &metrics.value_counts);
                    render_pivot(&mut out, &metrics.pivot_table);
                }
                MetricOutcome::NoData | MetricOutcome::Failed(_) => {
                    let _ = writeln!(out, "{NO_DATA}");
                }
            }
            let _ = writeln!(out);
        }
        out
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.4}")
    }
}

fn render_value_counts(out: &mut String, counts: &ValueCounts) {
    let _ = writeln!(out, "Value counts ({}):", counts.column);
    if counts.is_empty() {
        let _ = writeln!(out, "  {NO_DATA}");
        return;
    }
    let width = counts
        .keys()
        .map(|k| k.to_string().len())
        .max()
        .unwrap_or(0);
    for entry in &counts.entries {
        let shown = entry.proportion.unwrap_or(entry.count as f64);
        let _ = writeln!(
            out,
            "  {:<width$}  {}",
            entry.value.to_string(),
            format_number(shown)
        );
    }
}

fn render_pivot(out: &mut String, table: &PivotTable) {
    let _ = writeln!(
        out,
        "Pivot ({} x {}, {} of {}):",
        table.index_field, table.column_field, table.reducer, table.value_field
    );

    let header: Vec<String> = std::iter::once(String::new())
        .chain(table.column_keys.iter().map(|k| k.to_string()))
        .collect();
    let mut lines = vec![header];
    for (key, cells) in table.row_keys.iter().zip(&table.cells) {
        lines.push(
            std::iter::once(key.to_string())
                .chain(cells.iter().map(|v| format_number(*v)))
                .collect(),
        );
    }

    let columns = lines.first().map(Vec::len).unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|c| lines.iter().map(|line| line[c].len()).max().unwrap_or(0))
        .collect();
    for line in &lines {
        let mut text = String::from(" ");
        for (c, cell) in line.iter().enumerate() {
            if c == 0 {
                let _ = write!(text, " {:<w$}", cell, w = widths[c]);
            } else {
                let _ = write!(text, "  {:>w$}", cell, w = widths[c]);
            }
        }
        let _ = writeln!(out, "{}", text.trim_end());
    }
}

/// Resolves, aggregates and keeps the cache warm
pub struct MetricsService {
    config: MetricsConfig,
    reconciler: FetchReconciler,
    aggregator: ParallelAggregator,
    refresh: RefreshQueue,
    policy: RetryPolicy,
}

impl MetricsService {
    /// Build every component from configuration
    ///
    /// Fails when the configured cache backend cannot be constructed and no
    /// fallback applies, or when the view source is misconfigured.
    pub async fn from_config(config: MetricsConfig) -> Result<Self> {
        info!("Initializing metrics service");
        let provider = CacheProvider::from_config(&config.cache).await?;
        let source = viewmetrics_source::from_config(&config.source)?;
        info!(source = source.source_name(), "View source ready");
        Ok(Self::with_components(config, source, Arc::new(provider)))
    }

    /// Build with an explicit source and cache backend
    pub fn with_components(
        config: MetricsConfig,
        source: Arc<dyn ViewSource>,
        backend: Arc<dyn CacheBackend>,
    ) -> Self {
        let reconciler = FetchReconciler::new(
            source,
            DatasetCache::new(backend),
            config.cache.namespace.clone(),
            Duration::from_secs(config.cache.ttl_secs),
            WorkerPool::new("fetch", config.workers.max_concurrent_fetches),
        );
        let aggregator = ParallelAggregator::new(
            WorkerPool::new("aggregation", config.workers.max_concurrent_aggregations),
            config.fields.clone(),
        );
        let policy = RetryPolicy::from_config(&config.refresh);
        let refresh = RefreshQueue::start(reconciler.clone(), policy);

        Self {
            config,
            reconciler,
            aggregator,
            refresh,
            policy,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn refresh_queue(&self) -> &RefreshQueue {
        &self.refresh
    }

    pub fn cache_backend(&self) -> &'static str {
        self.reconciler.cache().backend().provider_name()
    }

    pub async fn cache_stats(&self) -> DatasetCacheStats {
        self.reconciler.cache().get_stats().await
    }

    /// Resolve `dataset_ids` and compute their metrics
    ///
    /// Every requested id appears in the report. When none of them came from
    /// the cache, the ids this call could not fetch get a background refresh.
    pub async fn resolve_and_aggregate(
        &self,
        dataset_ids: &[String],
        filter: &HashSet<String>,
    ) -> Result<MetricsReport> {
        let resolution = self.reconciler.resolve(dataset_ids).await?;

        let unresolved = resolution.refresh_candidates();
        let refresh_job = if unresolved.is_empty() {
            None
        } else {
            warn!(
                requested = resolution.requested.len(),
                refresh = unresolved.len(),
                "No dataset served from cache, queueing background refresh"
            );
            self.refresh
                .enqueue(unresolved, RefreshTrigger::DegradedCache)
                .await
        };

        let ready: HashMap<String, Dataset> = resolution
            .datasets
            .into_iter()
            .filter(|(_, dataset)| !dataset.is_empty())
            .collect();
        let mut aggregated = self.aggregator.aggregate(ready, filter).await;

        let mut metrics = BTreeMap::new();
        for id in resolution.requested {
            let outcome = match aggregated.remove(&id) {
                Some(Ok(m)) => MetricOutcome::Ready(m),
                Some(Err(e)) => MetricOutcome::Failed(e.to_string()),
                None => MetricOutcome::NoData,
            };
            metrics.insert(id, outcome);
        }

        let mut filter: Vec<String> = filter.iter().cloned().collect();
        filter.sort();
        let report = MetricsReport {
            metrics,
            filter,
            available_filters: self.config.available_filters.clone(),
            refresh_job,
        };
        info!(
            datasets = report.metrics.len(),
            ready = report.ready_count(),
            "Metrics report built"
        );
        Ok(report)
    }

    /// Report on the configured views
    pub async fn report(&self, filter: &HashSet<String>) -> Result<MetricsReport> {
        self.resolve_and_aggregate(&self.config.views, filter).await
    }

    /// Force-refresh the configured views in the foreground, with retries
    pub async fn refresh_now(&self) -> Result<usize> {
        let views = &self.config.views;
        self.policy
            .run(|attempt| {
                info!(attempt, views = views.len(), "Refreshing views");
                self.reconciler.refresh_all(views)
            })
            .await
    }

    /// Start the scheduled refresh of the configured views, if an interval is set
    pub fn start_scheduler(&mut self) -> bool {
        match self.config.refresh.interval_secs {
            Some(secs) => {
                let views = self.config.views.clone();
                self.refresh
                    .start_scheduler(views, Duration::from_secs(secs));
                true
            }
            None => false,
        }
    }

    /// Stop background work after queued refreshes finish
    pub async fn shutdown(self) {
        self.refresh.shutdown().await;
    }

    /// Stop background work now, abandoning queued refreshes
    pub async fn abort(self) {
        self.refresh.abort().await;
    }
}

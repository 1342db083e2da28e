use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use viewmetrics_server::cache::FileCache;
use viewmetrics_server::{CacheBackend, MetricOutcome, MetricsService};
use viewmetrics_shared::MetricsConfig;
use viewmetrics_source::DirectoryViewSource;

struct Fixture {
    _dir: TempDir,
    views: std::path::PathBuf,
    cache: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let views = dir.path().join("views");
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&views).unwrap();
        Self {
            _dir: dir,
            views,
            cache,
        }
    }

    fn write_view(&self, id: &str, rows: serde_json::Value) {
        std::fs::write(self.views.join(format!("{id}.json")), rows.to_string()).unwrap();
    }

    fn remove_view(&self, id: &str) {
        std::fs::remove_file(self.views.join(format!("{id}.json"))).unwrap();
    }

    fn service(&self) -> MetricsService {
        let mut config = MetricsConfig::default();
        config.cache.namespace = "ns".to_string();
        let source = Arc::new(DirectoryViewSource::new(&self.views));
        let backend: Arc<dyn CacheBackend> = Arc::new(FileCache::new(&self.cache).unwrap());
        MetricsService::with_components(config, source, backend)
    }

    fn cached_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.cache)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn sales() -> serde_json::Value {
    json!([
        {"category": "filter1", "date": "2024-01-01", "value": 10},
        {"category": "filter2", "date": "2024-01-01", "value": 4},
        {"category": "filter1", "date": "2024-01-02", "value": 6},
        {"category": "filter3", "date": "2024-01-02", "value": 1}
    ])
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn ready(outcome: &MetricOutcome) -> &viewmetrics_server::DatasetMetrics {
    match outcome {
        MetricOutcome::Ready(metrics) => metrics,
        other => panic!("expected metrics, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_view_reports_no_data_and_is_not_cached() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());
    let service = fixture.service();

    let report = service
        .resolve_and_aggregate(&ids(&["v1", "v2"]), &HashSet::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.len(), 2);
    assert_eq!(ready(&report.metrics["v1"]).row_count, 4);
    assert_eq!(report.metrics["v2"], MetricOutcome::NoData);
    assert!(report.render_text().contains("No data"));

    // nothing came from the cache, so a refresh was queued
    assert!(report.refresh_job.is_some());

    assert!(fixture.cache.join("ns%3Av1.json").exists());
    assert!(!fixture.cache.join("ns%3Av2.json").exists());
    service.abort().await;
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());
    let service = fixture.service();

    let first = service
        .resolve_and_aggregate(&ids(&["v1"]), &HashSet::new())
        .await
        .unwrap();

    // the source no longer has the view; only the cache can answer
    fixture.remove_view("v1");
    let second = service
        .resolve_and_aggregate(&ids(&["v1"]), &HashSet::new())
        .await
        .unwrap();

    assert_eq!(first.metrics["v1"], second.metrics["v1"]);
    assert!(second.refresh_job.is_none());

    let stats = service.cache_stats().await;
    assert!(stats.hits >= 1);
    service.abort().await;
}

#[tokio::test]
async fn test_filter_limits_categories_and_grand_total() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());
    let service = fixture.service();

    let filter: HashSet<String> = ["filter1".to_string()].into_iter().collect();
    let report = service
        .resolve_and_aggregate(&ids(&["v1"]), &filter)
        .await
        .unwrap();

    let metrics = ready(&report.metrics["v1"]);
    let keys: Vec<String> = metrics.value_counts.keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["filter1"]);
    assert_eq!(metrics.pivot_table.grand_total(), 2.0);
    assert_eq!(report.filter, vec!["filter1"]);
    service.abort().await;
}

#[tokio::test]
async fn test_stale_file_entry_is_refetched() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());

    std::fs::create_dir_all(&fixture.cache).unwrap();
    let stale = json!({
        "cached_at": "2020-01-01T00:00:00Z",
        "ttl_secs": 60,
        "records": [{"category": "old", "date": "2020-01-01", "value": 1}]
    });
    std::fs::write(fixture.cache.join("ns%3Av1.json"), stale.to_string()).unwrap();

    let service = fixture.service();
    let report = service
        .resolve_and_aggregate(&ids(&["v1"]), &HashSet::new())
        .await
        .unwrap();

    let metrics = ready(&report.metrics["v1"]);
    assert_eq!(metrics.row_count, 4);
    assert!(metrics.value_counts.count(&"old".into()).is_none());

    let stats = service.cache_stats().await;
    assert!(stats.stale >= 1);
    service.abort().await;
}

#[tokio::test]
async fn test_failed_aggregation_is_isolated() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());
    fixture.write_view("v2", json!([{"date": "2024-01-01", "value": 3}]));
    fixture.write_view("v3", json!([]));
    let service = fixture.service();

    let report = service
        .resolve_and_aggregate(&ids(&["v1", "v2", "v3"]), &HashSet::new())
        .await
        .unwrap();

    assert!(matches!(report.metrics["v1"], MetricOutcome::Ready(_)));
    match &report.metrics["v2"] {
        MetricOutcome::Failed(reason) => assert!(reason.contains("category")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.metrics["v3"], MetricOutcome::NoData);
    assert_eq!(report.ready_count(), 1);

    let text = report.render_text();
    assert_eq!(text.matches("No data").count(), 2);
    service.abort().await;
}

#[tokio::test]
async fn test_refresh_now_rewrites_cache() {
    let fixture = Fixture::new();
    fixture.write_view("v1", sales());
    fixture.write_view("v2", sales());

    let mut config = MetricsConfig::default();
    config.cache.namespace = "ns".to_string();
    config.views = ids(&["v1", "v2"]);
    let backend: Arc<dyn CacheBackend> = Arc::new(FileCache::new(&fixture.cache).unwrap());
    let service = MetricsService::with_components(
        config,
        Arc::new(DirectoryViewSource::new(&fixture.views)),
        backend,
    );

    assert_eq!(service.refresh_now().await.unwrap(), 2);
    assert_eq!(fixture.cached_files(), vec!["ns%3Av1.json", "ns%3Av2.json"]);
    service.shutdown().await;
}

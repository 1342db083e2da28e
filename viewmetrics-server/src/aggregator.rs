//! Fan-out of KPI computation across datasets

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};
use viewmetrics_shared::{AggregationError, Dataset, FieldConfig};

use crate::kpi::DatasetMetrics;
use crate::workers::WorkerPool;

/// Metrics for one dataset, or why they could not be computed
pub type AggregationResult = Result<DatasetMetrics, AggregationError>;

/// One dataset and the filter to apply to it before computing
struct WorkItem {
    dataset: Dataset,
    filter: Arc<HashSet<String>>,
}

pub struct ParallelAggregator {
    pool: WorkerPool,
    fields: Arc<FieldConfig>,
}

impl ParallelAggregator {
    pub fn new(pool: WorkerPool, fields: FieldConfig) -> Self {
        Self {
            pool,
            fields: Arc::new(fields),
        }
    }

    pub fn fields(&self) -> &FieldConfig {
        &self.fields
    }

    /// Compute the standard metrics for every dataset concurrently
    ///
    /// A non-empty `filter` keeps only rows whose category is in the set.
    /// Each dataset's outcome is independent; a failure or panic in one
    /// computation becomes an error for that id alone.
    pub async fn aggregate(
        &self,
        datasets: HashMap<String, Dataset>,
        filter: &HashSet<String>,
    ) -> BTreeMap<String, AggregationResult> {
        let filter = Arc::new(filter.clone());
        let items: Vec<(String, WorkItem)> = datasets
            .into_iter()
            .map(|(id, dataset)| {
                let item = WorkItem {
                    dataset,
                    filter: filter.clone(),
                };
                (id, item)
            })
            .collect();

        let fields = self.fields.clone();
        let outcomes = self
            .pool
            .run_blocking_keyed(items, move |id, item| compute(id, item, &fields))
            .await;

        let mut results = BTreeMap::new();
        for (id, outcome) in outcomes {
            let result = match outcome {
                Ok(result) => result,
                Err(failure) => Err(AggregationError::Task(failure.to_string())),
            };
            if let Err(e) = &result {
                error!(dataset_id = %id, error = %e, "Aggregation failed");
            }
            results.insert(id, result);
        }

        info!(
            datasets = results.len(),
            failed = results.values().filter(|r| r.is_err()).count(),
            filtered = !filter.is_empty(),
            "Aggregation completed"
        );
        results
    }
}

fn compute(id: &str, item: WorkItem, fields: &FieldConfig) -> AggregationResult {
    let dataset = if item.filter.is_empty() {
        item.dataset
    } else {
        item.dataset.filter_in(&fields.category, &item.filter)
    };
    debug!(dataset_id = id, rows = dataset.len(), "Computing metrics");
    DatasetMetrics::compute(&dataset, fields)
}

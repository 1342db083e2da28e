//! KPI computations over a single dataset
//!
//! Pure functions: frequency distributions and pivot tables with Grand Total
//! margins. Nothing here touches the cache or the network.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use viewmetrics_shared::{AggregationError, Dataset, FieldConfig, Scalar};

pub const GRAND_TOTAL: &str = "Grand Total";

type KpiResult<T> = Result<T, AggregationError>;

/// One distinct value and how often it occurs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub value: Scalar,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proportion: Option<f64>,
}

/// Frequency distribution of one column, most frequent value first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCounts {
    pub column: String,
    pub normalized: bool,
    /// Number of non-null values counted
    pub total: u64,
    pub entries: Vec<ValueCount>,
}

impl ValueCounts {
    pub fn keys(&self) -> impl Iterator<Item = &Scalar> {
        self.entries.iter().map(|e| &e.value)
    }

    pub fn count(&self, value: &Scalar) -> Option<u64> {
        self.find(value).map(|e| e.count)
    }

    /// The reported number for `value`: its share when normalized, else its count
    pub fn get(&self, value: &Scalar) -> Option<f64> {
        self.find(value)
            .map(|e| e.proportion.unwrap_or(e.count as f64))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, value: &Scalar) -> Option<&ValueCount> {
        self.entries.iter().find(|e| &e.value == value)
    }
}

/// Count distinct values of `column`
///
/// Nulls are not counted. Ties keep the order in which values first appear.
/// With `normalize` every entry also carries its share of the non-null total.
pub fn value_counts(dataset: &Dataset, column: &str, normalize: bool) -> KpiResult<ValueCounts> {
    let values = dataset
        .column_values(column)
        .ok_or_else(|| AggregationError::UnknownColumn(column.to_string()))?;

    let mut positions: HashMap<&Scalar, usize> = HashMap::new();
    let mut tallies: Vec<(&Scalar, u64)> = Vec::new();
    for value in values.filter(|v| !v.is_null()) {
        match positions.get(value) {
            Some(&i) => tallies[i].1 += 1,
            None => {
                positions.insert(value, tallies.len());
                tallies.push((value, 1));
            }
        }
    }

    // stable: equal counts stay in first-seen order
    tallies.sort_by(|a, b| b.1.cmp(&a.1));

    let total: u64 = tallies.iter().map(|(_, n)| n).sum();
    let entries = tallies
        .into_iter()
        .map(|(value, count)| ValueCount {
            value: value.clone(),
            count,
            proportion: normalize.then(|| count as f64 / total as f64),
        })
        .collect();

    Ok(ValueCounts {
        column: column.to_string(),
        normalized: normalize,
        total,
        entries,
    })
}

/// How the values of one pivot cell are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    /// Number of non-null values
    #[default]
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl Reducer {
    fn needs_numbers(self) -> bool {
        !matches!(self, Reducer::Count)
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reducer::Count => "count",
            Reducer::Sum => "sum",
            Reducer::Mean => "mean",
            Reducer::Min => "min",
            Reducer::Max => "max",
        };
        f.write_str(name)
    }
}

/// Running state that any reducer can be finished from
///
/// Merging two accumulators is the same as accumulating the union of their
/// raw values, so margins are the reducer applied to the margin's values.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Accumulator {
    fn push(&mut self, number: Option<f64>) {
        self.count += 1;
        if let Some(n) = number {
            self.sum += n;
            self.min = self.min.min(n);
            self.max = self.max.max(n);
        }
    }

    fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Empty cells fill with 0
    fn finish(&self, reducer: Reducer) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        match reducer {
            Reducer::Count => self.count as f64,
            Reducer::Sum => self.sum,
            Reducer::Mean => self.sum / self.count as f64,
            Reducer::Min => self.min,
            Reducer::Max => self.max,
        }
    }
}

/// Row or column label of a pivot table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PivotKey {
    Value(Scalar),
    GrandTotal,
}

impl fmt::Display for PivotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PivotKey::Value(v) => write!(f, "{v}"),
            PivotKey::GrandTotal => f.write_str(GRAND_TOTAL),
        }
    }
}

impl Serialize for PivotKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PivotKey::Value(v) => v.serialize(serializer),
            PivotKey::GrandTotal => serializer.serialize_str(GRAND_TOTAL),
        }
    }
}

/// Two-way aggregate table with a trailing Grand Total row and column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    pub index_field: String,
    pub column_field: String,
    pub value_field: String,
    pub reducer: Reducer,
    pub row_keys: Vec<PivotKey>,
    pub column_keys: Vec<PivotKey>,
    /// `cells[row][column]`, aligned with `row_keys` and `column_keys`
    pub cells: Vec<Vec<f64>>,
}

impl PivotTable {
    pub fn get(&self, row: &PivotKey, column: &PivotKey) -> Option<f64> {
        let r = self.row_keys.iter().position(|k| k == row)?;
        let c = self.column_keys.iter().position(|k| k == column)?;
        Some(self.cells[r][c])
    }

    pub fn cell(&self, row: impl Into<Scalar>, column: impl Into<Scalar>) -> Option<f64> {
        self.get(&PivotKey::Value(row.into()), &PivotKey::Value(column.into()))
    }

    /// The bottom-right cell
    pub fn grand_total(&self) -> f64 {
        self.cells
            .last()
            .and_then(|row| row.last())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Build a pivot of `value_field` by `index_field` rows and `column_field` columns
///
/// Rows whose index or column value is null are skipped. Axis labels are
/// sorted. Grand Total cells apply the reducer to every value in that margin.
pub fn pivot(
    dataset: &Dataset,
    index_field: &str,
    column_field: &str,
    value_field: &str,
    reducer: Reducer,
) -> KpiResult<PivotTable> {
    let lookup = |field: &str| {
        dataset
            .column_index(field)
            .ok_or_else(|| AggregationError::UnknownColumn(field.to_string()))
    };
    let index_i = lookup(index_field)?;
    let column_i = lookup(column_field)?;
    let value_i = lookup(value_field)?;

    let mut groups: BTreeMap<&Scalar, BTreeMap<&Scalar, Accumulator>> = BTreeMap::new();
    let mut column_labels: BTreeSet<&Scalar> = BTreeSet::new();

    for row in dataset.rows() {
        let (index, column, value) = (&row[index_i], &row[column_i], &row[value_i]);
        if index.is_null() || column.is_null() {
            continue;
        }
        column_labels.insert(column);
        let acc = groups.entry(index).or_default().entry(column).or_default();

        if value.is_null() {
            continue;
        }
        let number = value.as_f64();
        if reducer.needs_numbers() && number.is_none() {
            return Err(AggregationError::NonNumeric {
                column: value_field.to_string(),
                value: value.to_string(),
            });
        }
        acc.push(number);
    }

    let columns: Vec<&Scalar> = column_labels.into_iter().collect();
    let mut column_margins = vec![Accumulator::default(); columns.len()];
    let mut total = Accumulator::default();
    let mut cells = Vec::with_capacity(groups.len() + 1);

    for by_column in groups.values() {
        let mut row_margin = Accumulator::default();
        let mut line = Vec::with_capacity(columns.len() + 1);
        for (c, column) in columns.iter().enumerate() {
            let acc = by_column.get(column).copied().unwrap_or_default();
            line.push(acc.finish(reducer));
            row_margin.merge(&acc);
            column_margins[c].merge(&acc);
        }
        line.push(row_margin.finish(reducer));
        total.merge(&row_margin);
        cells.push(line);
    }

    let mut last: Vec<f64> = column_margins.iter().map(|acc| acc.finish(reducer)).collect();
    last.push(total.finish(reducer));
    cells.push(last);

    let row_keys = groups
        .keys()
        .map(|k| PivotKey::Value((*k).clone()))
        .chain(std::iter::once(PivotKey::GrandTotal))
        .collect();
    let column_keys = columns
        .into_iter()
        .map(|k| PivotKey::Value(k.clone()))
        .chain(std::iter::once(PivotKey::GrandTotal))
        .collect();

    Ok(PivotTable {
        index_field: index_field.to_string(),
        column_field: column_field.to_string(),
        value_field: value_field.to_string(),
        reducer,
        row_keys,
        column_keys,
        cells,
    })
}

/// The standard KPI pair computed for every dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetrics {
    pub row_count: usize,
    pub value_counts: ValueCounts,
    pub pivot_table: PivotTable,
}

impl DatasetMetrics {
    /// Category distribution plus a date-by-category count pivot
    pub fn compute(dataset: &Dataset, fields: &FieldConfig) -> KpiResult<Self> {
        Ok(Self {
            row_count: dataset.len(),
            value_counts: value_counts(dataset, &fields.category, true)?,
            pivot_table: pivot(
                dataset,
                &fields.date,
                &fields.category,
                &fields.value,
                Reducer::Count,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales() -> Dataset {
        Dataset::from_records_value(&json!([
            {"category": "filter1", "date": "2024-01-01", "value": 10},
            {"category": "filter2", "date": "2024-01-01", "value": 5},
            {"category": "filter1", "date": "2024-01-02", "value": 7},
            {"category": "filter3", "date": "2024-01-02", "value": 1.5},
            {"category": "filter1", "date": "2024-01-02", "value": 3},
            {"category": "filter2", "date": "2024-01-03", "value": 2}
        ]))
        .unwrap()
    }

    #[test]
    fn test_value_counts_order_and_ties() {
        let counts = value_counts(&sales(), "category", false).unwrap();
        let keys: Vec<String> = counts.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["filter1", "filter2", "filter3"]);
        assert_eq!(counts.count(&"filter1".into()), Some(3));
        assert_eq!(counts.get(&"filter2".into()), Some(2.0));
        assert_eq!(counts.total, 6);

        let tied = Dataset::from_records_value(&json!([
            {"c": "b"}, {"c": "a"}, {"c": "a"}, {"c": "b"}, {"c": "z"}
        ]))
        .unwrap();
        let counts = value_counts(&tied, "c", false).unwrap();
        let keys: Vec<String> = counts.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "a", "z"]);
    }

    #[test]
    fn test_value_counts_normalized_skips_nulls() {
        let data = Dataset::from_records_value(&json!([
            {"c": "x"}, {"c": null}, {"c": "x"}, {"c": "y"}, {}
        ]))
        .unwrap();
        let counts = value_counts(&data, "c", true).unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.entries.len(), 2);
        let share = counts.get(&"x".into()).unwrap();
        assert!((share - 2.0 / 3.0).abs() < 1e-12);
        let sum: f64 = counts.entries.iter().filter_map(|e| e.proportion).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_value_counts_unknown_column() {
        let err = value_counts(&sales(), "region", true).unwrap_err();
        assert_eq!(err, AggregationError::UnknownColumn("region".to_string()));
    }

    #[test]
    fn test_value_counts_empty_dataset() {
        let empty = Dataset::from_rows(vec!["category".to_string()], vec![]).unwrap();
        let counts = value_counts(&empty, "category", true).unwrap();
        assert!(counts.is_empty());
        assert_eq!(counts.total, 0);
    }

    #[test]
    fn test_pivot_count_layout_and_totals() {
        let table = pivot(&sales(), "date", "category", "value", Reducer::Count).unwrap();

        let rows: Vec<String> = table.row_keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(rows, vec!["2024-01-01", "2024-01-02", "2024-01-03", GRAND_TOTAL]);
        let columns: Vec<String> = table.column_keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(columns, vec!["filter1", "filter2", "filter3", GRAND_TOTAL]);

        assert_eq!(table.cell("2024-01-02", "filter1"), Some(2.0));
        // missing combination fills with zero
        assert_eq!(table.cell("2024-01-03", "filter1"), Some(0.0));
        assert_eq!(
            table.get(&PivotKey::Value("2024-01-02".into()), &PivotKey::GrandTotal),
            Some(3.0)
        );
        assert_eq!(
            table.get(&PivotKey::GrandTotal, &PivotKey::Value("filter2".into())),
            Some(2.0)
        );
        assert_eq!(table.grand_total(), 6.0);
    }

    #[test]
    fn test_pivot_grand_total_matches_filtered_row_count() {
        let allowed = ["filter1".to_string(), "filter3".to_string()].into_iter().collect();
        let filtered = sales().filter_in("category", &allowed);
        let table = pivot(&filtered, "date", "category", "value", Reducer::Count).unwrap();
        assert_eq!(table.grand_total(), filtered.len() as f64);
        assert_eq!(table.grand_total(), 4.0);
    }

    #[test]
    fn test_pivot_sum_and_margins_equal_sum_of_cells() {
        let table = pivot(&sales(), "date", "category", "value", Reducer::Sum).unwrap();
        assert_eq!(table.cell("2024-01-02", "filter1"), Some(10.0));
        assert_eq!(
            table.get(&PivotKey::GrandTotal, &PivotKey::Value("filter1".into())),
            Some(20.0)
        );
        assert_eq!(table.grand_total(), 28.5);
    }

    #[test]
    fn test_pivot_mean_margin_is_recomputed() {
        let table = pivot(&sales(), "date", "category", "value", Reducer::Mean).unwrap();
        // 2024-01-02 holds 7, 1.5 and 3: mean of the raw values, not of the cells
        let margin = table
            .get(&PivotKey::Value("2024-01-02".into()), &PivotKey::GrandTotal)
            .unwrap();
        assert!((margin - 11.5 / 3.0).abs() < 1e-12);
        assert!((table.grand_total() - 28.5 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_pivot_min_max_margins() {
        let min = pivot(&sales(), "date", "category", "value", Reducer::Min).unwrap();
        assert_eq!(min.grand_total(), 1.5);
        let max = pivot(&sales(), "date", "category", "value", Reducer::Max).unwrap();
        assert_eq!(max.grand_total(), 10.0);
        assert_eq!(
            max.get(&PivotKey::GrandTotal, &PivotKey::Value("filter2".into())),
            Some(5.0)
        );
    }

    #[test]
    fn test_pivot_skips_null_keys_and_rejects_text_for_sum() {
        let data = Dataset::from_records_value(&json!([
            {"d": "x", "c": "a", "v": 1},
            {"d": null, "c": "a", "v": 1},
            {"d": "x", "c": null, "v": 1},
            {"d": "x", "c": "a", "v": null}
        ]))
        .unwrap();
        let table = pivot(&data, "d", "c", "v", Reducer::Count).unwrap();
        assert_eq!(table.row_keys.len(), 2);
        assert_eq!(table.grand_total(), 1.0);

        let text = Dataset::from_records_value(&json!([{"d": "x", "c": "a", "v": "n/a"}])).unwrap();
        let err = pivot(&text, "d", "c", "v", Reducer::Sum).unwrap_err();
        assert!(matches!(err, AggregationError::NonNumeric { .. }));
        // counting does not need numbers
        assert!(pivot(&text, "d", "c", "v", Reducer::Count).is_ok());
    }

    #[test]
    fn test_pivot_empty_and_unknown_field() {
        let empty = Dataset::from_rows(
            vec!["d".to_string(), "c".to_string(), "v".to_string()],
            vec![],
        )
        .unwrap();
        let table = pivot(&empty, "d", "c", "v", Reducer::Count).unwrap();
        assert_eq!(table.row_keys, vec![PivotKey::GrandTotal]);
        assert_eq!(table.column_keys, vec![PivotKey::GrandTotal]);
        assert_eq!(table.grand_total(), 0.0);

        let err = pivot(&sales(), "date", "region", "value", Reducer::Count).unwrap_err();
        assert_eq!(err, AggregationError::UnknownColumn("region".to_string()));
    }

    #[test]
    fn test_dataset_metrics_uses_configured_fields() {
        let metrics = DatasetMetrics::compute(&sales(), &FieldConfig::default()).unwrap();
        assert_eq!(metrics.row_count, 6);
        assert!(metrics.value_counts.normalized);
        assert_eq!(metrics.pivot_table.grand_total(), 6.0);

        let fields = FieldConfig {
            category: "kind".to_string(),
            ..FieldConfig::default()
        };
        assert!(DatasetMetrics::compute(&sales(), &fields).is_err());
    }
}

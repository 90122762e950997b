use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// The reserved column carrying each row's timestamp.
pub const TIME_COLUMN: &str = "timestamp";
/// The reserved column carrying each row's sensor name.
pub const SENSOR_COLUMN: &str = "sensor_name";
/// The reserved column carrying each row's asset id.
pub const ASSET_COLUMN: &str = "asset_id";

/// Storage tier a partition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Aggregated,
    Daily,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Aggregated => "aggregated",
            Self::Daily => "daily",
        }
    }

    /// Fixed fallback order used when the preferred tier comes up empty.
    pub fn fallback_order() -> [Tier; 3] {
        [Tier::Raw, Tier::Aggregated, Tier::Daily]
    }
}

/// The tier a `QueryResult` actually drew from, including the degraded case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierUsed {
    Raw,
    Aggregated,
    Daily,
    Error,
}

impl From<Tier> for TierUsed {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Raw => Self::Raw,
            Tier::Aggregated => Self::Aggregated,
            Tier::Daily => Self::Daily,
        }
    }
}

/// Supported bucket aggregation methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationMethod {
    Avg,
    Min,
    Max,
    First,
    Last,
    Count,
    Sum,
}

impl AggregationMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "avg" | "average" | "mean" => Some(Self::Avg),
            "min" | "minimum" => Some(Self::Min),
            "max" | "maximum" => Some(Self::Max),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "count" => Some(Self::Count),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
            Self::Count => "count",
            Self::Sum => "sum",
        }
    }
}

/// A single typed column. Columns within a `Batch` are kept as parallel
/// vectors of equal length, indexed implicitly by row.
#[derive(Debug, Clone)]
pub enum Column {
    Time(Vec<DateTime<Utc>>),
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Time(v) => v.len(),
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_time(&self) -> Option<&[DateTime<Utc>]> {
        match self {
            Self::Time(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Self::Numeric(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&[String]> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// An in-memory, open-schema columnar batch. New sensors or tag columns can
/// be added without touching existing rows.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    row_count: usize,
    columns: BTreeMap<String, Column>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Inserts a column, growing `row_count` if this is the first column
    /// added (or asserting the lengths already agree).
    pub fn insert_column(&mut self, name: impl Into<String>, column: Column) {
        let len = column.len();
        if self.columns.is_empty() {
            self.row_count = len;
        }
        debug_assert_eq!(
            len, self.row_count,
            "column length must match existing batch row count"
        );
        self.columns.insert(name.into(), column);
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        self.column(TIME_COLUMN)
            .and_then(Column::as_time)
            .unwrap_or(&[])
    }

    pub fn sensor_names(&self) -> &[String] {
        self.column(SENSOR_COLUMN)
            .and_then(Column::as_text)
            .unwrap_or(&[])
    }

    pub fn asset_ids(&self) -> &[String] {
        self.column(ASSET_COLUMN)
            .and_then(Column::as_text)
            .unwrap_or(&[])
    }

    /// Row `i` as `(timestamp, sensor_name, asset_id)`, the dedup key used
    /// when merging hybrid local/remote results.
    pub fn dedup_key(&self, i: usize) -> Option<(DateTime<Utc>, String, String)> {
        let ts = self.timestamps().get(i).copied()?;
        let sensor = self.sensor_names().get(i).cloned()?;
        let asset = self.asset_ids().get(i).cloned()?;
        Some((ts, sensor, asset))
    }

    /// Appends `other`'s rows after this batch's rows. Columns present in
    /// only one of the two batches are padded with nulls represented as
    /// empty/NaN values matching the existing column's type where possible.
    pub fn extend(&mut self, other: Batch) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        let mut names: Vec<String> = self.columns.keys().cloned().collect();
        for name in other.columns.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        for name in names {
            let left = self.columns.remove(&name);
            let right = other.columns.get(&name).cloned();
            let merged = match (left, right) {
                (Some(Column::Time(mut l)), Some(Column::Time(r))) => {
                    l.extend(r);
                    Column::Time(l)
                }
                (Some(Column::Numeric(mut l)), Some(Column::Numeric(r))) => {
                    l.extend(r);
                    Column::Numeric(l)
                }
                (Some(Column::Text(mut l)), Some(Column::Text(r))) => {
                    l.extend(r);
                    Column::Text(l)
                }
                (Some(Column::Time(mut l)), None) => {
                    l.extend(std::iter::repeat(l.last().copied().unwrap_or_default()).take(other.row_count));
                    Column::Time(l)
                }
                (Some(Column::Numeric(mut l)), None) => {
                    l.extend(std::iter::repeat(f64::NAN).take(other.row_count));
                    Column::Numeric(l)
                }
                (Some(Column::Text(mut l)), None) => {
                    l.extend(std::iter::repeat(String::new()).take(other.row_count));
                    Column::Text(l)
                }
                (None, Some(Column::Time(r))) => {
                    let mut l: Vec<DateTime<Utc>> =
                        std::iter::repeat(r.first().copied().unwrap_or_default())
                            .take(self.row_count)
                            .collect();
                    l.extend(r);
                    Column::Time(l)
                }
                (None, Some(Column::Numeric(r))) => {
                    let mut l: Vec<f64> = std::iter::repeat(f64::NAN).take(self.row_count).collect();
                    l.extend(r);
                    Column::Numeric(l)
                }
                (None, Some(Column::Text(r))) => {
                    let mut l: Vec<String> =
                        std::iter::repeat(String::new()).take(self.row_count).collect();
                    l.extend(r);
                    Column::Text(l)
                }
                _ => continue,
            };
            self.columns.insert(name, merged);
        }
        self.row_count += other.row_count;
    }

    /// Reorders all columns to follow ascending timestamp order.
    pub fn sort_by_time(&mut self) {
        let timestamps = self.timestamps().to_vec();
        let mut order: Vec<usize> = (0..timestamps.len()).collect();
        order.sort_by_key(|&i| timestamps[i]);
        self.reorder(&order);
    }

    /// Keeps the first occurrence of each `(timestamp, sensor, asset)` key,
    /// in current row order. Callers control precedence by choosing which
    /// batch's rows come first before calling this.
    pub fn dedup_by_key(&mut self) {
        let mut seen = std::collections::HashSet::new();
        let mut keep = Vec::with_capacity(self.row_count);
        for i in 0..self.row_count {
            let key = self.dedup_key(i);
            match key {
                Some(key) => {
                    if seen.insert(key) {
                        keep.push(i);
                    }
                }
                None => keep.push(i),
            }
        }
        self.reorder(&keep);
    }

    fn reorder(&mut self, order: &[usize]) {
        for column in self.columns.values_mut() {
            *column = match column {
                Column::Time(v) => Column::Time(order.iter().map(|&i| v[i]).collect()),
                Column::Numeric(v) => Column::Numeric(order.iter().map(|&i| v[i]).collect()),
                Column::Text(v) => Column::Text(order.iter().map(|&i| v[i].clone()).collect()),
            };
        }
        self.row_count = order.len();
    }

    /// Selects `indices` into a new batch, keeping every column (not just
    /// the reserved ones) so per-group slicing doesn't drop open-schema
    /// metric columns.
    pub(crate) fn select_rows(&self, indices: &[usize]) -> Batch {
        let mut selected = self.clone();
        selected.reorder(indices);
        selected
    }

    /// Retains only rows whose timestamp falls in `[start, end)`.
    pub fn filter_time_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let timestamps = self.timestamps().to_vec();
        let keep: Vec<usize> = (0..timestamps.len())
            .filter(|&i| timestamps[i] >= start && timestamps[i] < end)
            .collect();
        self.reorder(&keep);
    }

    /// Retains only rows whose sensor/asset membership matches the given
    /// allow-lists. An empty list means "no filter" for that dimension.
    pub fn filter_sensors_assets(&mut self, sensors: &[String], assets: &[String]) {
        let sensor_names = self.sensor_names().to_vec();
        let asset_ids = self.asset_ids().to_vec();
        let keep: Vec<usize> = (0..self.row_count)
            .filter(|&i| {
                let sensor_ok = sensors.is_empty()
                    || sensor_names.get(i).map(|s| sensors.contains(s)).unwrap_or(false);
                let asset_ok =
                    assets.is_empty() || asset_ids.get(i).map(|a| assets.contains(a)).unwrap_or(false);
                sensor_ok && asset_ok
            })
            .collect();
        self.reorder(&keep);
    }

    pub fn truncate_rows(&mut self, max_rows: usize) {
        if self.row_count <= max_rows {
            return;
        }
        let order: Vec<usize> = (0..max_rows).collect();
        self.reorder(&order);
    }
}

/// A single time-series query, as issued to the `Engine`.
#[derive(Debug, Clone)]
pub struct Query {
    pub sensors: Vec<String>,
    pub assets: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_ms: Option<u64>,
    pub aggregation: Option<AggregationMethod>,
    pub max_datapoints: usize,
    pub preferred_tier: Option<Tier>,
}

impl Query {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

/// Result of executing a `Query`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub batch: Batch,
    pub tier_used: TierUsed,
    pub truncated: bool,
    pub actual_end_time: DateTime<Utc>,
    pub cached: bool,
}

impl QueryResult {
    pub fn empty(tier_used: TierUsed, end: DateTime<Utc>) -> Self {
        Self {
            batch: Batch::new(),
            tier_used,
            truncated: false,
            actual_end_time: end,
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sample_batch(rows: &[(i64, &str, &str, f64)]) -> Batch {
        let mut batch = Batch::new();
        batch.insert_column(TIME_COLUMN, Column::Time(rows.iter().map(|r| ts(r.0)).collect()));
        batch.insert_column(
            SENSOR_COLUMN,
            Column::Text(rows.iter().map(|r| r.1.to_string()).collect()),
        );
        batch.insert_column(
            ASSET_COLUMN,
            Column::Text(rows.iter().map(|r| r.2.to_string()).collect()),
        );
        batch.insert_column("value", Column::Numeric(rows.iter().map(|r| r.3).collect()));
        batch
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_row_order() {
        let remote = sample_batch(&[(1, "temp", "a1", 10.0), (2, "temp", "a1", 11.0)]);
        let mut local = sample_batch(&[(1, "temp", "a1", 99.0), (3, "temp", "a1", 12.0)]);
        let mut merged = remote;
        merged.extend(std::mem::take(&mut local));
        merged.dedup_by_key();
        assert_eq!(merged.row_count(), 3);
        let values = merged.column("value").unwrap().as_numeric().unwrap();
        assert_eq!(values, &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn sort_by_time_reorders_all_columns_together() {
        let mut batch = sample_batch(&[(3, "a", "x", 1.0), (1, "a", "x", 2.0), (2, "a", "x", 3.0)]);
        batch.sort_by_time();
        let values = batch.column("value").unwrap().as_numeric().unwrap();
        assert_eq!(values, &[2.0, 3.0, 1.0]);
    }

    #[test]
    fn filter_time_range_is_half_open() {
        let mut batch = sample_batch(&[(0, "a", "x", 1.0), (5, "a", "x", 2.0), (10, "a", "x", 3.0)]);
        batch.filter_time_range(ts(0), ts(10));
        assert_eq!(batch.row_count(), 2);
    }

    #[test]
    fn truncate_rows_caps_without_touching_smaller_batches() {
        let mut batch = sample_batch(&[(0, "a", "x", 1.0), (1, "a", "x", 2.0)]);
        batch.truncate_rows(10);
        assert_eq!(batch.row_count(), 2);
        batch.truncate_rows(1);
        assert_eq!(batch.row_count(), 1);
    }
}

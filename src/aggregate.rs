use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::model::{AggregationMethod, Batch, Column, ASSET_COLUMN, SENSOR_COLUMN, TIME_COLUMN};

/// Candidate bucket widths, smallest first. `calculate_optimal_interval`
/// picks the first entry that keeps the point count within budget.
pub const INTERVAL_LADDER_MS: [u64; 9] = [
    1_000, 5_000, 10_000, 30_000, 60_000, 300_000, 600_000, 1_800_000, 3_600_000,
];

/// Sensor name fragments that always aggregate with `last` rather than
/// `avg` — discrete state, not a continuous measurement.
const STATUS_LIKE_TOKENS: [&str; 4] = ["status", "state", "mode", "alarm"];

fn bucket_start_ms(ts_ms: i64, interval_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(interval_ms)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Picks the smallest ladder interval that keeps `duration_seconds` worth
/// of points at or under `max_datapoints`. Falls back to the coarsest
/// ladder entry (1h) if even that overflows the budget — the caller is
/// still expected to truncate after aggregating.
pub fn calculate_optimal_interval(duration_seconds: i64, max_datapoints: usize) -> u64 {
    if max_datapoints == 0 || duration_seconds <= 0 {
        return INTERVAL_LADDER_MS[0];
    }
    let duration_ms = duration_seconds.max(0) as u128 * 1000;
    for &interval in INTERVAL_LADDER_MS.iter() {
        let points = duration_ms / interval as u128 + 1;
        if points <= max_datapoints as u128 {
            return interval;
        }
    }
    *INTERVAL_LADDER_MS.last().unwrap()
}

/// Names of `batch`'s open-schema numeric measurement columns — every
/// column that isn't one of the three reserved ones.
fn numeric_metric_columns(batch: &Batch) -> Vec<String> {
    batch
        .columns()
        .iter()
        .filter(|(name, column)| {
            name.as_str() != TIME_COLUMN
                && name.as_str() != SENSOR_COLUMN
                && name.as_str() != ASSET_COLUMN
                && matches!(column, Column::Numeric(_))
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Reduces one metric column's values over `indices` by `method`. `count`
/// counts every row in the group regardless of nullity; `avg`/`min`/`max`/
/// `sum` exclude non-finite (NaN) values; `first`/`last` sort the group by
/// timestamp first so they reflect chronological order rather than
/// whatever order rows happened to arrive in.
fn reduce_metric(
    method: AggregationMethod,
    indices: &[usize],
    values: &[f64],
    timestamps: &[DateTime<Utc>],
) -> f64 {
    match method {
        AggregationMethod::Count => indices.len() as f64,
        AggregationMethod::First | AggregationMethod::Last => {
            let mut pairs: Vec<(DateTime<Utc>, f64)> = indices
                .iter()
                .filter_map(|&i| values.get(i).map(|&v| (timestamps[i], v)))
                .collect();
            pairs.sort_by_key(|(ts, _)| *ts);
            let picked = if method == AggregationMethod::First {
                pairs.first()
            } else {
                pairs.last()
            };
            picked.map(|(_, v)| *v).unwrap_or(f64::NAN)
        }
        AggregationMethod::Avg | AggregationMethod::Min | AggregationMethod::Max | AggregationMethod::Sum => {
            let finite: Vec<f64> = indices
                .iter()
                .filter_map(|&i| values.get(i).copied())
                .filter(|v| v.is_finite())
                .collect();
            if finite.is_empty() {
                return f64::NAN;
            }
            match method {
                AggregationMethod::Avg => finite.iter().sum::<f64>() / finite.len() as f64,
                AggregationMethod::Min => finite.iter().cloned().fold(f64::INFINITY, f64::min),
                AggregationMethod::Max => finite.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                AggregationMethod::Sum => finite.iter().sum(),
                _ => unreachable!(),
            }
        }
    }
}

/// Buckets `batch`'s rows into `interval_ms`-wide windows, grouped by
/// `(time_bucket, sensor_name?, asset_id?)` — whichever of the latter two
/// columns are actually present in `batch` — and reduces every numeric
/// measurement column independently with `method`. The representative
/// timestamp kept per bucket is the first raw timestamp encountered for
/// that group, not the bucket boundary itself.
pub fn aggregate_by_interval(batch: &Batch, interval_ms: u64, method: AggregationMethod) -> Batch {
    let timestamps = batch.timestamps();
    if timestamps.is_empty() {
        return Batch::new();
    }
    let has_sensor = batch.column(SENSOR_COLUMN).is_some();
    let has_asset = batch.column(ASSET_COLUMN).is_some();
    let sensors = batch.sensor_names();
    let assets = batch.asset_ids();
    let metric_names = numeric_metric_columns(batch);

    let mut groups: BTreeMap<(i64, String, String), Vec<usize>> = BTreeMap::new();
    for i in 0..batch.row_count() {
        let bucket = bucket_start_ms(millis(timestamps[i]), interval_ms as i64);
        let key = (
            bucket,
            sensors.get(i).cloned().unwrap_or_default(),
            assets.get(i).cloned().unwrap_or_default(),
        );
        groups.entry(key).or_default().push(i);
    }

    let mut time_col = Vec::with_capacity(groups.len());
    let mut sensor_col = Vec::with_capacity(groups.len());
    let mut asset_col = Vec::with_capacity(groups.len());
    let mut metric_cols: Vec<Vec<f64>> = vec![Vec::with_capacity(groups.len()); metric_names.len()];

    for ((_, sensor, asset), indices) in &groups {
        time_col.push(timestamps[indices[0]]);
        sensor_col.push(sensor.clone());
        asset_col.push(asset.clone());
        for (m, name) in metric_names.iter().enumerate() {
            let column = batch.column(name).and_then(Column::as_numeric).unwrap_or(&[]);
            metric_cols[m].push(reduce_metric(method, indices, column, timestamps));
        }
    }

    let mut out = Batch::new();
    out.insert_column(TIME_COLUMN, Column::Time(time_col));
    if has_sensor {
        out.insert_column(SENSOR_COLUMN, Column::Text(sensor_col));
    }
    if has_asset {
        out.insert_column(ASSET_COLUMN, Column::Text(asset_col));
    }
    for (name, values) in metric_names.into_iter().zip(metric_cols.into_iter()) {
        out.insert_column(name, Column::Numeric(values));
    }
    out.sort_by_time();
    out
}

/// Downsamples `batch` so its row count fits within `max_datapoints`,
/// returning the (possibly unchanged) batch and whether truncation/
/// aggregation altered it.
pub fn downsample_to_max_points(batch: &Batch, max_datapoints: usize) -> (Batch, bool) {
    if batch.row_count() <= max_datapoints || max_datapoints == 0 {
        return (batch.clone(), false);
    }
    let timestamps = batch.timestamps();
    let (Some(&first), Some(&last)) = (timestamps.first(), timestamps.last()) else {
        // No timestamp column to bucket on: fall back to an evenly spaced
        // index-stride sample of the original rows.
        return (stride_sample(batch, max_datapoints), true);
    };
    let duration_seconds = (last - first).num_seconds().max(1);
    let interval_ms = calculate_optimal_interval(duration_seconds, max_datapoints);
    let mut aggregated = aggregate_by_interval(batch, interval_ms, AggregationMethod::Avg);
    if aggregated.is_empty() && !batch.is_empty() {
        // Bucketing failed (e.g. no numeric columns to reduce): fall back
        // to an evenly spaced sample of the original rows.
        return (stride_sample(batch, max_datapoints), true);
    }
    if aggregated.row_count() > max_datapoints {
        aggregated.sort_by_time();
        aggregated.truncate_rows(max_datapoints);
    }
    (aggregated, true)
}

/// Picks `max_datapoints` evenly spaced rows (by index stride) out of
/// `batch`, preserving original column order. Used as the downsampling
/// fallback when bucketing can't run at all.
fn stride_sample(batch: &Batch, max_datapoints: usize) -> Batch {
    if max_datapoints == 0 || batch.row_count() <= max_datapoints {
        return batch.clone();
    }
    let step = (batch.row_count() / max_datapoints).max(1);
    let indices: Vec<usize> = (0..batch.row_count()).step_by(step).take(max_datapoints).collect();
    batch.select_rows(&indices)
}

fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean.abs() < f64::EPSILON {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt() / mean.abs())
}

/// Chooses the aggregation method `apply_smart_aggregation` would use for
/// one sensor's values: `last` for status-like sensor names, `avg`
/// otherwise. The coefficient-of-variation check against low-variance
/// readings over long windows is kept as an explicit, testable branch even
/// though it currently agrees with the default, mirroring the policy this
/// was ported from.
pub fn choose_aggregation_method(sensor_name: &str, values: &[f64], duration_seconds: i64) -> AggregationMethod {
    let lower = sensor_name.to_lowercase();
    if STATUS_LIKE_TOKENS.iter().any(|token| lower.contains(token)) {
        return AggregationMethod::Last;
    }
    if duration_seconds >= 3600 {
        if let Some(cov) = coefficient_of_variation(values) {
            if cov < 0.1 {
                return AggregationMethod::Avg;
            }
        }
    }
    AggregationMethod::Avg
}

/// Applies `choose_aggregation_method` per `(sensor, asset)` group in
/// `batch` — based on the group's first numeric metric column — and
/// aggregates each group's full row set (every metric column) at
/// `interval_ms`, concatenating the results back into one batch.
pub fn apply_smart_aggregation(batch: &Batch, interval_ms: u64, duration_seconds: i64) -> Batch {
    let timestamps = batch.timestamps();
    if timestamps.is_empty() {
        return Batch::new();
    }
    let sensors = batch.sensor_names();
    let assets = batch.asset_ids();
    let metric_names = numeric_metric_columns(batch);

    let mut by_sensor_asset: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for i in 0..batch.row_count() {
        by_sensor_asset
            .entry((
                sensors.get(i).cloned().unwrap_or_default(),
                assets.get(i).cloned().unwrap_or_default(),
            ))
            .or_default()
            .push(i);
    }

    let mut result = Batch::new();
    for ((sensor, _asset), indices) in by_sensor_asset {
        let representative: Vec<f64> = metric_names
            .first()
            .and_then(|name| batch.column(name).and_then(Column::as_numeric))
            .map(|column| indices.iter().filter_map(|&i| column.get(i).copied()).collect())
            .unwrap_or_default();
        let method = choose_aggregation_method(&sensor, &representative, duration_seconds);

        let group_batch = batch.select_rows(&indices);
        result.extend(aggregate_by_interval(&group_batch, interval_ms, method));
    }
    result.sort_by_time();
    result
}

/// Builds the pre-aggregated companion batch the rebuilder writes: every
/// numeric measurement column `<col>` gets `<col>_mean`/`<col>_min`/
/// `<col>_max` siblings per bucket (spec §3's aggregated-tier companion
/// columns), alongside the usual reserved columns.
pub fn create_pre_aggregated_data(batch: &Batch, interval_ms: u64) -> Batch {
    let timestamps = batch.timestamps();
    if timestamps.is_empty() {
        return Batch::new();
    }
    let has_sensor = batch.column(SENSOR_COLUMN).is_some();
    let has_asset = batch.column(ASSET_COLUMN).is_some();
    let sensors = batch.sensor_names();
    let assets = batch.asset_ids();
    let metric_names = numeric_metric_columns(batch);

    let mut groups: BTreeMap<(i64, String, String), Vec<usize>> = BTreeMap::new();
    for i in 0..batch.row_count() {
        let bucket = bucket_start_ms(millis(timestamps[i]), interval_ms as i64);
        groups
            .entry((
                bucket,
                sensors.get(i).cloned().unwrap_or_default(),
                assets.get(i).cloned().unwrap_or_default(),
            ))
            .or_default()
            .push(i);
    }

    let mut time_col = Vec::with_capacity(groups.len());
    let mut sensor_col = Vec::with_capacity(groups.len());
    let mut asset_col = Vec::with_capacity(groups.len());
    let mut mean_cols: Vec<Vec<f64>> = vec![Vec::with_capacity(groups.len()); metric_names.len()];
    let mut min_cols: Vec<Vec<f64>> = vec![Vec::with_capacity(groups.len()); metric_names.len()];
    let mut max_cols: Vec<Vec<f64>> = vec![Vec::with_capacity(groups.len()); metric_names.len()];

    for ((_, sensor, asset), indices) in &groups {
        time_col.push(timestamps[indices[0]]);
        sensor_col.push(sensor.clone());
        asset_col.push(asset.clone());
        for (m, name) in metric_names.iter().enumerate() {
            let column = batch.column(name).and_then(Column::as_numeric).unwrap_or(&[]);
            mean_cols[m].push(reduce_metric(AggregationMethod::Avg, indices, column, timestamps));
            min_cols[m].push(reduce_metric(AggregationMethod::Min, indices, column, timestamps));
            max_cols[m].push(reduce_metric(AggregationMethod::Max, indices, column, timestamps));
        }
    }

    let mut out = Batch::new();
    out.insert_column(TIME_COLUMN, Column::Time(time_col));
    if has_sensor {
        out.insert_column(SENSOR_COLUMN, Column::Text(sensor_col));
    }
    if has_asset {
        out.insert_column(ASSET_COLUMN, Column::Text(asset_col));
    }
    for (m, name) in metric_names.into_iter().enumerate() {
        out.insert_column(format!("{name}_mean"), Column::Numeric(std::mem::take(&mut mean_cols[m])));
        out.insert_column(format!("{name}_min"), Column::Numeric(std::mem::take(&mut min_cols[m])));
        out.insert_column(format!("{name}_max"), Column::Numeric(std::mem::take(&mut max_cols[m])));
    }
    out.sort_by_time();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_batch(rows: usize, step_seconds: i64) -> Batch {
        let mut batch = Batch::new();
        let timestamps: Vec<DateTime<Utc>> = (0..rows)
            .map(|i| Utc.timestamp_opt(i as i64 * step_seconds, 0).unwrap())
            .collect();
        batch.insert_column(TIME_COLUMN, Column::Time(timestamps));
        batch.insert_column(
            SENSOR_COLUMN,
            Column::Text(std::iter::repeat("temperature".to_string()).take(rows).collect()),
        );
        batch.insert_column(
            ASSET_COLUMN,
            Column::Text(std::iter::repeat("pump1".to_string()).take(rows).collect()),
        );
        batch.insert_column(
            "value",
            Column::Numeric((0..rows).map(|i| i as f64 * 0.01).collect()),
        );
        batch
    }

    #[test]
    fn one_second_rows_bucket_into_one_minute_averages() {
        let batch = make_batch(3600, 1);
        let aggregated = aggregate_by_interval(&batch, 60_000, AggregationMethod::Avg);
        assert_eq!(aggregated.row_count(), 60);
        let values = aggregated.column("value").unwrap().as_numeric().unwrap();
        for (k, &value) in values.iter().enumerate() {
            let expected = (60.0 * k as f64 + 29.5) * 0.01;
            assert!((value - expected).abs() < 1e-9, "bucket {k}: {value} vs {expected}");
        }
    }

    #[test]
    fn every_numeric_column_is_reduced_independently() {
        let mut batch = make_batch(120, 1);
        batch.insert_column("pressure", Column::Numeric((0..120).map(|i| i as f64 * 2.0).collect()));

        let aggregated = aggregate_by_interval(&batch, 60_000, AggregationMethod::Avg);
        assert_eq!(aggregated.row_count(), 2);
        let pressure = aggregated.column("pressure").unwrap().as_numeric().unwrap();
        assert!((pressure[0] - 58.0).abs() < 1e-9);
        assert!((pressure[1] - 178.0).abs() < 1e-9);
    }

    #[test]
    fn avg_min_max_sum_exclude_nan_but_count_does_not() {
        let mut batch = Batch::new();
        batch.insert_column(
            TIME_COLUMN,
            Column::Time(vec![Utc.timestamp_opt(0, 0).unwrap(); 3]),
        );
        batch.insert_column(
            SENSOR_COLUMN,
            Column::Text(vec!["temp".to_string(); 3]),
        );
        batch.insert_column(ASSET_COLUMN, Column::Text(vec!["pump1".to_string(); 3]));
        batch.insert_column("value", Column::Numeric(vec![10.0, f64::NAN, 20.0]));

        let avg = aggregate_by_interval(&batch, 60_000, AggregationMethod::Avg);
        assert_eq!(avg.column("value").unwrap().as_numeric().unwrap(), &[15.0]);

        let count = aggregate_by_interval(&batch, 60_000, AggregationMethod::Count);
        assert_eq!(count.column("value").unwrap().as_numeric().unwrap(), &[3.0]);
    }

    #[test]
    fn first_and_last_reflect_chronological_order_not_input_order() {
        let mut batch = Batch::new();
        batch.insert_column(
            TIME_COLUMN,
            Column::Time(vec![
                Utc.timestamp_opt(5, 0).unwrap(),
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(10, 0).unwrap(),
            ]),
        );
        batch.insert_column(SENSOR_COLUMN, Column::Text(vec!["temp".to_string(); 3]));
        batch.insert_column(ASSET_COLUMN, Column::Text(vec!["pump1".to_string(); 3]));
        batch.insert_column("value", Column::Numeric(vec![50.0, 0.0, 100.0]));

        let first = aggregate_by_interval(&batch, 60_000, AggregationMethod::First);
        assert_eq!(first.column("value").unwrap().as_numeric().unwrap(), &[0.0]);

        let last = aggregate_by_interval(&batch, 60_000, AggregationMethod::Last);
        assert_eq!(last.column("value").unwrap().as_numeric().unwrap(), &[100.0]);
    }

    #[test]
    fn no_numeric_columns_yields_one_row_per_bucket_with_only_group_keys() {
        let mut batch = Batch::new();
        batch.insert_column(
            TIME_COLUMN,
            Column::Time(vec![Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(1, 0).unwrap()]),
        );
        batch.insert_column(SENSOR_COLUMN, Column::Text(vec!["temp".to_string(); 2]));
        batch.insert_column(ASSET_COLUMN, Column::Text(vec!["pump1".to_string(); 2]));

        let aggregated = aggregate_by_interval(&batch, 60_000, AggregationMethod::Avg);
        assert_eq!(aggregated.row_count(), 1);
        assert!(aggregated.columns().len() <= 3);
    }

    #[test]
    fn calculate_optimal_interval_respects_point_budget() {
        let interval = calculate_optimal_interval(3600, 60);
        assert_eq!(interval, 60_000);
        let interval = calculate_optimal_interval(24 * 3600, 100);
        assert!(interval >= 600_000);
    }

    #[test]
    fn downsample_is_a_no_op_under_budget() {
        let batch = make_batch(10, 60);
        let (result, truncated) = downsample_to_max_points(&batch, 1000);
        assert_eq!(result.row_count(), 10);
        assert!(!truncated);
    }

    #[test]
    fn downsample_reduces_row_count_to_budget() {
        let batch = make_batch(3600, 1);
        let (result, truncated) = downsample_to_max_points(&batch, 100);
        assert!(truncated);
        assert!(result.row_count() <= 100);
    }

    #[test]
    fn downsample_falls_back_to_stride_sample_when_bucketing_yields_nothing() {
        let mut batch = Batch::new();
        batch.insert_column(
            TIME_COLUMN,
            Column::Time((0..10).map(|i| Utc.timestamp_opt(i, 0).unwrap()).collect()),
        );
        // No numeric columns at all: bucketing can't reduce anything.
        let (result, truncated) = downsample_to_max_points(&batch, 3);
        assert!(truncated);
        assert!(result.row_count() <= 3);
    }

    #[test]
    fn status_like_sensor_names_use_last() {
        assert_eq!(
            choose_aggregation_method("pump_status", &[1.0, 0.0, 1.0], 7200),
            AggregationMethod::Last
        );
        assert_eq!(
            choose_aggregation_method("ALARM_LEVEL", &[1.0, 0.0], 7200),
            AggregationMethod::Last
        );
    }

    #[test]
    fn continuous_sensor_names_use_avg() {
        assert_eq!(
            choose_aggregation_method("temperature", &[20.0, 20.1, 19.9], 7200),
            AggregationMethod::Avg
        );
    }

    #[test]
    fn smart_aggregation_preserves_every_metric_column_per_group() {
        let mut batch = make_batch(120, 1);
        batch.insert_column("pressure", Column::Numeric((0..120).map(|i| i as f64).collect()));

        let result = apply_smart_aggregation(&batch, 60_000, 7200);
        assert_eq!(result.row_count(), 2);
        assert!(result.column("value").is_some());
        assert!(result.column("pressure").is_some());
    }

    #[test]
    fn pre_aggregated_data_carries_mean_min_max_companions_per_metric() {
        let mut batch = make_batch(120, 1);
        batch.insert_column("pressure", Column::Numeric((0..120).map(|i| i as f64).collect()));

        let pre = create_pre_aggregated_data(&batch, 60_000);
        assert_eq!(pre.row_count(), 2);
        let min = pre.column("value_min").unwrap().as_numeric().unwrap();
        let max = pre.column("value_max").unwrap().as_numeric().unwrap();
        assert!(min[0] < max[0]);
        assert!(pre.column("pressure_mean").is_some());
        assert!(pre.column("pressure_min").is_some());
        assert!(pre.column("pressure_max").is_some());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::StorageMode;
use crate::error::QueryResult;
use crate::model::{Batch, Tier};
use crate::partition;

use super::{BackendStats, StorageBackend};

/// Fans a tiered read out across the configured local and/or remote
/// backends, merging hybrid results with remote rows taking precedence
/// over local rows for the same `(timestamp, sensor, asset)` key.
pub struct SensorDataReader {
    local: Option<Arc<dyn StorageBackend>>,
    remote: Option<Arc<dyn StorageBackend>>,
    mode: StorageMode,
}

impl SensorDataReader {
    pub fn new(
        local: Option<Arc<dyn StorageBackend>>,
        remote: Option<Arc<dyn StorageBackend>>,
        mode: StorageMode,
    ) -> Self {
        Self { local, remote, mode }
    }

    pub async fn read_tier(
        &self,
        sensors: &[String],
        assets: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tier: Tier,
    ) -> QueryResult<Batch> {
        let paths = partition::enumerate(sensors, assets, start, end, tier);
        let path_strings: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        if path_strings.is_empty() {
            return Ok(Batch::new());
        }

        match self.mode {
            StorageMode::Local => match &self.local {
                Some(backend) => backend.read_parquet(&path_strings).await,
                None => Ok(Batch::new()),
            },
            StorageMode::Remote => match &self.remote {
                Some(backend) => backend.read_parquet(&path_strings).await,
                None => Ok(Batch::new()),
            },
            StorageMode::Hybrid => {
                let remote_batch = match &self.remote {
                    Some(backend) => backend
                        .read_parquet(&path_strings)
                        .await
                        .unwrap_or_else(|_| Batch::new()),
                    None => Batch::new(),
                };
                let local_batch = match &self.local {
                    Some(backend) => backend
                        .read_parquet(&path_strings)
                        .await
                        .unwrap_or_else(|_| Batch::new()),
                    None => Batch::new(),
                };
                let mut merged = remote_batch;
                merged.extend(local_batch);
                merged.sort_by_time();
                merged.dedup_by_key();
                Ok(merged)
            }
        }
    }

    pub async fn get_available_assets(&self) -> QueryResult<Vec<String>> {
        let mut assets = std::collections::BTreeSet::new();
        for backend in self.backends() {
            for file in backend.list_files("").await.unwrap_or_default() {
                if let Some(asset) = file.split('/').next() {
                    assets.insert(asset.to_string());
                }
            }
        }
        Ok(assets.into_iter().collect())
    }

    pub async fn get_available_sensors(&self, asset: &str) -> QueryResult<Vec<String>> {
        let mut sensors = std::collections::BTreeSet::new();
        for backend in self.backends() {
            for file in backend.list_files(asset).await.unwrap_or_default() {
                if let Some(filename) = file.rsplit('/').next() {
                    let sensor = filename
                        .trim_end_matches(".parquet")
                        .split('.')
                        .next()
                        .unwrap_or(filename);
                    sensors.insert(sensor.to_string());
                }
            }
        }
        Ok(sensors.into_iter().collect())
    }

    /// True if any configured backend already has a file at `path`. Used by
    /// the rebuilder's coverage check.
    pub async fn file_exists(&self, path: &str) -> bool {
        for backend in self.backends() {
            if matches!(backend.file_exists(path).await, Ok(true)) {
                return true;
            }
        }
        false
    }

    /// `(min, max)` of the raw-tier hour timestamps covering `sensors`
    /// (all sensors if empty) under `assets` (discovered if `None`).
    /// Derived from the raw partition path grammar rather than a stored
    /// index, since the core treats partition files as the source of truth.
    pub async fn get_time_range(
        &self,
        sensors: &[String],
        assets: Option<&[String]>,
    ) -> QueryResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let resolved_assets = match assets {
            Some(given) if !given.is_empty() => given.to_vec(),
            _ => self.get_available_assets().await?,
        };

        let mut min_ts: Option<DateTime<Utc>> = None;
        let mut max_ts: Option<DateTime<Utc>> = None;
        for asset in &resolved_assets {
            for backend in self.backends() {
                for file in backend.list_files(asset).await.unwrap_or_default() {
                    let Some((ts, sensor)) = parse_raw_hour_path(&file) else {
                        continue;
                    };
                    if !sensors.is_empty() && !sensors.contains(&sensor) {
                        continue;
                    }
                    min_ts = Some(min_ts.map_or(ts, |m| m.min(ts)));
                    max_ts = Some(max_ts.map_or(ts, |m| m.max(ts)));
                }
            }
        }
        Ok(min_ts.zip(max_ts))
    }

    pub async fn health_check(&self) -> bool {
        let mut healthy = true;
        for backend in self.backends() {
            healthy &= backend.health_check().await;
        }
        healthy
    }

    /// Per-backend health, keyed `"local"`/`"remote"` like `storage_stats`.
    pub async fn health_report(&self) -> HashMap<String, bool> {
        let mut report = HashMap::new();
        if let Some(local) = &self.local {
            report.insert("local".to_string(), local.health_check().await);
        }
        if let Some(remote) = &self.remote {
            report.insert("remote".to_string(), remote.health_check().await);
        }
        report
    }

    pub fn storage_stats(&self) -> HashMap<String, BackendStats> {
        let mut stats = HashMap::new();
        if let Some(local) = &self.local {
            stats.insert("local".to_string(), local.stats());
        }
        if let Some(remote) = &self.remote {
            stats.insert("remote".to_string(), remote.stats());
        }
        stats
    }

    fn backends(&self) -> Vec<&Arc<dyn StorageBackend>> {
        [&self.local, &self.remote].into_iter().flatten().collect()
    }
}

/// Parses a raw-tier relative path (`<asset>/<YYYY>/<MM>/<DD>/<HH>/<sensor>.parquet`)
/// into its hour timestamp and sensor name. Returns `None` for paths that
/// don't match the raw grammar (e.g. aggregated/daily tier listings).
fn parse_raw_hour_path(path: &str) -> Option<(DateTime<Utc>, String)> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 6 {
        return None;
    }
    let year: i32 = parts[1].parse().ok()?;
    let month: u32 = parts[2].parse().ok()?;
    let day: u32 = parts[3].parse().ok()?;
    let hour: u32 = parts[4].parse().ok()?;
    let sensor = parts[5].strip_suffix(".parquet")?.split('.').next()?.to_string();
    let ts = Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single()?;
    Some((ts, sensor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ASSET_COLUMN, SENSOR_COLUMN, TIME_COLUMN};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct StubBackend {
        batch: Batch,
    }

    #[async_trait]
    impl StorageBackend for StubBackend {
        async fn list_files(&self, _prefix: &str) -> QueryResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn read_parquet(&self, _paths: &[String]) -> QueryResult<Batch> {
            Ok(self.batch.clone())
        }
        async fn file_exists(&self, _path: &str) -> QueryResult<bool> {
            Ok(false)
        }
        async fn health_check(&self) -> bool {
            true
        }
        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    struct ListingStubBackend {
        files: Vec<String>,
    }

    #[async_trait]
    impl StorageBackend for ListingStubBackend {
        async fn list_files(&self, _prefix: &str) -> QueryResult<Vec<String>> {
            Ok(self.files.clone())
        }
        async fn read_parquet(&self, _paths: &[String]) -> QueryResult<Batch> {
            Ok(Batch::new())
        }
        async fn file_exists(&self, _path: &str) -> QueryResult<bool> {
            Ok(false)
        }
        async fn health_check(&self) -> bool {
            true
        }
        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    fn batch_with(rows: &[(i64, f64)]) -> Batch {
        let mut batch = Batch::new();
        batch.insert_column(
            TIME_COLUMN,
            Column::Time(rows.iter().map(|r| Utc.timestamp_opt(r.0, 0).unwrap()).collect()),
        );
        batch.insert_column(
            SENSOR_COLUMN,
            Column::Text(rows.iter().map(|_| "temp".to_string()).collect()),
        );
        batch.insert_column(
            ASSET_COLUMN,
            Column::Text(rows.iter().map(|_| "pump1".to_string()).collect()),
        );
        batch.insert_column("value", Column::Numeric(rows.iter().map(|r| r.1).collect()));
        batch
    }

    #[tokio::test]
    async fn hybrid_mode_prefers_remote_rows_on_key_collision() {
        let remote = Arc::new(StubBackend {
            batch: batch_with(&[(0, 10.0), (60, 11.0)]),
        });
        let local = Arc::new(StubBackend {
            batch: batch_with(&[(0, 99.0), (120, 12.0)]),
        });
        let reader = SensorDataReader::new(Some(local), Some(remote), StorageMode::Hybrid);

        let batch = reader
            .read_tier(
                &["temp".to_string()],
                &["pump1".to_string()],
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(3600, 0).unwrap(),
                Tier::Raw,
            )
            .await
            .unwrap();

        assert_eq!(batch.row_count(), 3);
        let values = batch.column("value").unwrap().as_numeric().unwrap();
        assert_eq!(values, &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn parse_raw_hour_path_extracts_timestamp_and_sensor() {
        let (ts, sensor) = parse_raw_hour_path("pump1/2024/01/02/03/temp.parquet").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap());
        assert_eq!(sensor, "temp");
        assert!(parse_raw_hour_path("pump1/2024/01/temp.daily.parquet").is_none());
    }

    #[tokio::test]
    async fn get_time_range_spans_min_and_max_hour_across_matching_sensors() {
        let local = Arc::new(ListingStubBackend {
            files: vec![
                "pump1/2024/01/01/00/temp.parquet".to_string(),
                "pump1/2024/01/03/12/temp.parquet".to_string(),
                "pump1/2024/01/02/06/humidity.parquet".to_string(),
            ],
        });
        let reader = SensorDataReader::new(Some(local), None, StorageMode::Local);

        let (min, max) = reader
            .get_time_range(&["temp".to_string()], Some(&["pump1".to_string()]))
            .await
            .unwrap()
            .expect("expected a non-empty range");
        assert_eq!(min, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(max, Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap());
    }
}

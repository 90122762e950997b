use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::aggregate;
use crate::cache::{self, CacheStats, SmartCacheManager};
use crate::config::AppConfig;
use crate::error::{QueryError, QueryResult as Result_};
use crate::model::{Query, QueryResult, Tier, TierUsed};
use crate::storage::reader::SensorDataReader;
use crate::storage::{BackendStats, LocalBackend, RemoteBackend, StorageBackend};

/// Health report shape (spec §4.H): overall boolean plus the per-backend
/// diagnostic map and cache stats that feed into it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub backends: HashMap<String, bool>,
    pub cache: CacheStats,
}

/// Counts dropped by a housekeeping pass: TTL-expired cache entries and
/// stale frequency-tracker rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct HousekeepingReport {
    pub cache_entries_expired: usize,
    pub frequency_entries_dropped: usize,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    pub queries_total: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub invalid_argument_total: AtomicU64,
    pub backend_fault_total: AtomicU64,
    pub internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub queries_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalid_argument_total: u64,
    pub backend_fault_total: u64,
    pub internal_error_total: u64,
}

/// Ties the reader, cache, and aggregator together into the query
/// execution pipeline: validate, check cache, pick a tier (preferred then
/// the fixed fallback order), read, smart-aggregate, post-filter,
/// downsample, and cache the result.
pub struct Engine {
    reader: SensorDataReader,
    cache: SmartCacheManager,
    stats: EngineStats,
    max_datapoints_default: usize,
    max_absolute_datapoints: usize,
    max_query_duration_hours: f64,
    raw_tier_max_hours: f64,
    aggregated_tier_max_hours: f64,
    enable_smart_aggregation: bool,
    frequency_max_age: Duration,
}

impl Engine {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let local: Option<Arc<dyn StorageBackend>> = if config.storage_mode.uses_local() {
            Some(Arc::new(LocalBackend::new(
                config.local_data_root.clone(),
                config.local_listing_ttl_seconds,
                config.max_workers,
            )))
        } else {
            None
        };

        let remote: Option<Arc<dyn StorageBackend>> = if config.storage_mode.uses_remote() {
            let account = config
                .azure_account
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("remote storage mode requires SQS_AZURE_STORAGE_ACCOUNT"))?;
            let container = config.azure_container.as_deref().unwrap_or("sensor-data");
            Some(Arc::new(RemoteBackend::new_azure(
                account,
                container,
                config.azure_access_key.as_deref(),
                config.azure_sas_token.as_deref(),
                config.remote_prefix.clone(),
                config.tmp_path.clone(),
                config.remote_listing_ttl_seconds,
                config.max_workers,
            )?))
        } else {
            None
        };

        let reader = SensorDataReader::new(local, remote, config.storage_mode);
        let cache = SmartCacheManager::new(
            config.cache_max_entries,
            config.cache_max_bytes,
            config.cache_default_ttl_seconds,
            config.cache_min_duration_seconds,
            config.cache_min_sensor_count_bypass,
        );

        Ok(Self {
            reader,
            cache,
            stats: EngineStats::default(),
            max_datapoints_default: config.max_datapoints_default,
            max_absolute_datapoints: config.max_absolute_datapoints,
            max_query_duration_hours: config.max_query_duration_hours,
            raw_tier_max_hours: config.raw_tier_max_hours,
            aggregated_tier_max_hours: config.aggregated_tier_max_hours,
            enable_smart_aggregation: config.enable_smart_aggregation,
            frequency_max_age: Duration::from_secs(config.frequency_max_age_hours * 3600),
        })
    }

    pub fn reader(&self) -> &SensorDataReader {
        &self.reader
    }

    /// Builds an `Engine` directly around a pre-built `SensorDataReader`,
    /// skipping `AppConfig`/Azure setup. Used by tests exercising the
    /// specialized engines (`RawEngine`/`AggregatedEngine`), which hold a
    /// borrowed `&Engine` and need something lighter than a full
    /// environment-backed config to construct one.
    #[cfg(test)]
    pub(crate) fn for_test(reader: SensorDataReader) -> Self {
        Self {
            reader,
            cache: SmartCacheManager::new(500, 256 * 1024 * 1024, 300, 360, 5),
            stats: EngineStats::default(),
            max_datapoints_default: 10_000,
            max_absolute_datapoints: 50_000,
            max_query_duration_hours: 8760.0,
            raw_tier_max_hours: 24.0,
            aggregated_tier_max_hours: 168.0,
            enable_smart_aggregation: true,
            frequency_max_age: Duration::from_secs(24 * 3600),
        }
    }

    /// Assets are optional (an empty selector means "all assets", resolved
    /// later by discovery); sensors are not.
    fn validate(&self, query: &Query) -> Result_<()> {
        if query.sensors.is_empty() {
            return Err(QueryError::invalid_argument("at least one sensor must be specified"));
        }
        if query.start >= query.end {
            return Err(QueryError::invalid_argument("start must be before end"));
        }
        if query.max_datapoints == 0 {
            return Err(QueryError::invalid_argument("max_datapoints must be greater than zero"));
        }
        let duration_hours = query.duration_seconds() as f64 / 3600.0;
        if duration_hours > self.max_query_duration_hours {
            return Err(QueryError::invalid_argument(format!(
                "query spans {duration_hours:.1}h, exceeding the {:.1}h maximum",
                self.max_query_duration_hours
            )));
        }
        Ok(())
    }

    /// Picks the tier a query would prefer given its span, per the
    /// `raw_max_h < aggregated_max_h` threshold ladder in §4.D. Honors an
    /// explicit `Query::preferred_tier` override (used by the specialized
    /// engines) instead of recomputing it.
    fn preferred_tier(&self, query: &Query) -> Tier {
        query.preferred_tier.unwrap_or_else(|| {
            select_tier_by_duration(
                query.duration_seconds() as f64 / 3600.0,
                self.raw_tier_max_hours,
                self.aggregated_tier_max_hours,
            )
        })
    }

    /// Executes `query`, never returning `Err` for anything other than
    /// `InvalidArgument` — every other failure mode degrades to an empty
    /// `QueryResult` tagged `TierUsed::Error`.
    pub async fn query(&self, mut query: Query) -> Result_<QueryResult> {
        self.stats.queries_total.fetch_add(1, Ordering::Relaxed);
        if query.max_datapoints > self.max_absolute_datapoints {
            query.max_datapoints = self.max_absolute_datapoints;
        }
        self.validate(&query).map_err(|err| {
            self.stats.invalid_argument_total.fetch_add(1, Ordering::Relaxed);
            err
        })?;

        let key = cache::fingerprint(&query);
        if let Some(mut cached) = self.cache.get_cached_result(key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            cached.cached = true;
            return Ok(cached);
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let result = match self.execute_tiered_query(&query).await {
            Ok(result) => result,
            Err(err) => {
                match &err {
                    QueryError::BackendFault(_) => {
                        self.stats.backend_fault_total.fetch_add(1, Ordering::Relaxed);
                    }
                    QueryError::InternalError(_) => {
                        self.stats.internal_error_total.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                tracing::warn!(error = %err, "query execution degraded to empty result");
                QueryResult::empty(TierUsed::Error, query.end)
            }
        };

        let estimated_size = estimate_size_bytes(&result);
        if self.cache.should_cache_query(&query, estimated_size) {
            self.cache.cache_result(key, result.clone(), estimated_size);
        }

        Ok(result)
    }

    async fn execute_tiered_query(&self, query: &Query) -> Result_<QueryResult> {
        let assets = if query.assets.is_empty() {
            self.reader.get_available_assets().await?
        } else {
            query.assets.clone()
        };
        if assets.is_empty() {
            return Ok(QueryResult::empty(TierUsed::Raw, query.end));
        }

        let order = tier_order(Some(self.preferred_tier(query)));
        let mut batch = crate::model::Batch::new();
        let mut tier_used = TierUsed::Error;
        for tier in order {
            let candidate = match self
                .reader
                .read_tier(&query.sensors, &assets, query.start, query.end, tier)
                .await
            {
                Ok(candidate) => candidate,
                Err(err) => {
                    tracing::warn!(?tier, error = %err, "tier read failed, falling back to next tier");
                    continue;
                }
            };
            if !candidate.is_empty() {
                batch = candidate;
                tier_used = tier.into();
                break;
            }
        }

        if batch.is_empty() {
            return Ok(QueryResult::empty(TierUsed::Raw, query.end));
        }

        batch.filter_time_range(query.start, query.end);
        batch.filter_sensors_assets(&query.sensors, &query.assets);

        if let Some(interval_ms) = query.interval_ms {
            let method = query.aggregation.unwrap_or(crate::model::AggregationMethod::Avg);
            batch = aggregate::aggregate_by_interval(&batch, interval_ms, method);
        } else {
            let duration_seconds = query.duration_seconds();
            let interval_ms = aggregate::calculate_optimal_interval(duration_seconds, query.max_datapoints);
            batch = if self.enable_smart_aggregation {
                aggregate::apply_smart_aggregation(&batch, interval_ms, duration_seconds)
            } else {
                aggregate::aggregate_by_interval(&batch, interval_ms, crate::model::AggregationMethod::Avg)
            };
        }

        let (batch, truncated) = aggregate::downsample_to_max_points(&batch, query.max_datapoints);
        let actual_end_time = batch.timestamps().last().copied().unwrap_or(query.end);

        Ok(QueryResult {
            batch,
            tier_used,
            truncated,
            actual_end_time,
            cached: false,
        })
    }

    pub async fn get_available_sensors(&self, asset: &str) -> Result_<Vec<String>> {
        self.reader.get_available_sensors(asset).await
    }

    pub async fn get_available_assets(&self) -> Result_<Vec<String>> {
        self.reader.get_available_assets().await
    }

    /// `(min, max)` of the raw-tier hour timestamps covering `sensors`
    /// under `assets` (all discovered assets if `None`).
    pub async fn get_time_range(
        &self,
        sensors: &[String],
        assets: Option<&[String]>,
    ) -> Result_<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.reader.get_time_range(sensors, assets).await
    }

    pub fn get_query_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries_total: self.stats.queries_total.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            invalid_argument_total: self.stats.invalid_argument_total.load(Ordering::Relaxed),
            backend_fault_total: self.stats.backend_fault_total.load(Ordering::Relaxed),
            internal_error_total: self.stats.internal_error_total.load(Ordering::Relaxed),
        }
    }

    pub fn storage_stats(&self) -> HashMap<String, BackendStats> {
        self.reader.storage_stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear_all();
    }

    pub async fn health_check(&self) -> bool {
        self.reader.health_check().await
    }

    /// Full health report: per-backend diagnostics plus cache stats,
    /// aggregated to unhealthy iff any configured backend is unhealthy
    /// (spec §4.H).
    pub async fn health_report(&self) -> HealthReport {
        let backends = self.reader.health_report().await;
        let healthy = !backends.is_empty() && backends.values().all(|&ok| ok);
        HealthReport {
            healthy,
            backends,
            cache: self.cache.get_cache_stats(),
        }
    }

    /// Drops TTL-expired cache entries and frequency-tracker rows older
    /// than `frequency_max_age_hours`. Intended to be called on a slow
    /// interval by the process entry point, not per-query.
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        HousekeepingReport {
            cache_entries_expired: self.cache.cleanup_expired(),
            frequency_entries_dropped: self.cache.cleanup_frequency_tracking(self.frequency_max_age),
        }
    }

    pub fn default_max_datapoints(&self) -> usize {
        self.max_datapoints_default
    }

    pub fn max_absolute_datapoints(&self) -> usize {
        self.max_absolute_datapoints
    }

    /// Raw-tier facade (spec §4.G): fixed `interval_ms=1000`,
    /// `aggregation=last`, window pre-truncated to the point budget.
    pub async fn query_raw(
        &self,
        sensors: &[String],
        assets: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result_<QueryResult> {
        crate::specialized::RawEngine::new(self)
            .query_raw_data(sensors, assets, start, end, self.max_absolute_datapoints)
            .await
    }

    /// Aggregated-tier facade (spec §4.G): auto-interval, reads the
    /// pre-computed minute/daily tier's companion column directly, falling
    /// back to the general tiered executor when no precomputed batch
    /// covers the window.
    pub async fn query_aggregated(
        &self,
        sensors: &[String],
        assets: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        aggregation: Option<crate::model::AggregationMethod>,
        max_datapoints: usize,
    ) -> Result_<QueryResult> {
        crate::specialized::AggregatedEngine::new(self)
            .query_aggregated_data(sensors, assets, start, end, aggregation, max_datapoints)
            .await
    }
}

/// `raw_max_h < aggregated_max_h` per spec §3's tier invariant; a duration
/// at or under `raw_max_h` prefers raw, at or under `aggregated_max_h`
/// prefers the minute aggregate, otherwise the daily tier.
fn select_tier_by_duration(duration_hours: f64, raw_max_h: f64, aggregated_max_h: f64) -> Tier {
    if duration_hours <= raw_max_h {
        Tier::Raw
    } else if duration_hours <= aggregated_max_h {
        Tier::Aggregated
    } else {
        Tier::Daily
    }
}

fn tier_order(preferred: Option<Tier>) -> Vec<Tier> {
    match preferred {
        Some(tier) => {
            let mut order = vec![tier];
            order.extend(Tier::fallback_order().into_iter().filter(|t| *t != tier));
            order
        }
        None => Tier::fallback_order().to_vec(),
    }
}

fn estimate_size_bytes(result: &QueryResult) -> u64 {
    let rows = result.batch.row_count() as u64;
    let columns = result.batch.columns().len() as u64;
    rows * columns * 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_puts_preferred_tier_first_then_fixed_fallback() {
        let order = tier_order(Some(Tier::Daily));
        assert_eq!(order, vec![Tier::Daily, Tier::Raw, Tier::Aggregated]);

        let order = tier_order(None);
        assert_eq!(order, vec![Tier::Raw, Tier::Aggregated, Tier::Daily]);
    }

    #[test]
    fn tier_selection_follows_duration_thresholds() {
        assert_eq!(select_tier_by_duration(1.0, 24.0, 168.0), Tier::Raw);
        assert_eq!(select_tier_by_duration(48.0, 24.0, 168.0), Tier::Aggregated);
        assert_eq!(select_tier_by_duration(300.0, 24.0, 168.0), Tier::Daily);
    }
}

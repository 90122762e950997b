use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;

use sensor_query_service::cli::{Args, Command};
use sensor_query_service::config::AppConfig;
use sensor_query_service::engine::Engine;
use sensor_query_service::model::{AggregationMethod, Tier};
use sensor_query_service::rebuilder::Rebuilder;

fn parse_tier(value: &str) -> Result<Tier> {
    match value.trim().to_lowercase().as_str() {
        "aggregated" | "minute" => Ok(Tier::Aggregated),
        "daily" | "hourly" | "hour" => Ok(Tier::Daily),
        other => anyhow::bail!("unrecognized tier '{other}'; expected 'aggregated' or 'daily'"),
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse '{value}' as an RFC 3339 timestamp"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let engine = Engine::from_config(&config).context("failed to initialize query engine")?;

    match args.command {
        Command::Serve { poll_interval_seconds } => run_serve(&engine, poll_interval_seconds).await,
        Command::Rebuild { sensor_id, asset_id, start, end, tier } => {
            run_rebuild(&engine, &config, &sensor_id, &asset_id, &start, &end, &tier).await
        }
        Command::RebuildAll { sensor_id, start, end, tier } => {
            run_rebuild_all(&engine, &config, sensor_id, start, end, &tier).await
        }
        Command::Stats => print_stats(&engine).await,
        Command::Validate { sensor_id, asset_id, start, end } => {
            run_validate(&engine, &config, &sensor_id, &asset_id, &start, &end).await
        }
        Command::QueryRaw { sensors, assets, start, end } => {
            run_query_raw(&engine, sensors, assets, &start, &end).await
        }
        Command::QueryAggregated { sensors, assets, start, end, aggregation, max_datapoints } => {
            run_query_aggregated(&engine, sensors, assets, &start, &end, &aggregation, max_datapoints).await
        }
    }
}

/// Polls health/stats on an interval, runs cache housekeeping, and logs
/// both, exiting cleanly on Ctrl-C. There is no HTTP surface here — wiring
/// one over `Engine` is explicitly out of scope (see DESIGN.md).
async fn run_serve(engine: &Engine, poll_interval_seconds: u64) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval_seconds.max(1)));
    tracing::info!(poll_interval_seconds, "sensor-query-service poll loop started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = engine.health_report().await;
                let stats = engine.get_query_stats();
                tracing::info!(
                    healthy = health.healthy,
                    backends = ?health.backends,
                    cache_entries = health.cache.entries,
                    queries_total = stats.queries_total,
                    cache_hits = stats.cache_hits,
                    cache_misses = stats.cache_misses,
                    backend_fault_total = stats.backend_fault_total,
                    "health/stats poll"
                );
                let housekeeping = engine.run_housekeeping();
                if housekeeping.cache_entries_expired > 0 || housekeeping.frequency_entries_dropped > 0 {
                    tracing::info!(
                        cache_entries_expired = housekeeping.cache_entries_expired,
                        frequency_entries_dropped = housekeeping.frequency_entries_dropped,
                        "housekeeping pass"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

async fn run_rebuild(
    engine: &Engine,
    config: &AppConfig,
    sensor_id: &str,
    asset_id: &str,
    start: &str,
    end: &str,
    tier: &str,
) -> Result<()> {
    let tier = parse_tier(tier)?;
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;

    let rebuilder = Rebuilder::new(
        engine.reader(),
        config.local_data_root.clone(),
        config.rebuild_minute_chunk_hours,
        config.rebuild_daily_chunk_days,
    );
    let report = rebuilder
        .rebuild_aggregated_data(sensor_id, asset_id, start, end, tier)
        .await
        .context("rebuild failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.meets_threshold(config.rebuild_min_success_rate) {
        anyhow::bail!(
            "rebuild for {sensor_id}/{asset_id} succeeded on only {:.1}% of chunks (threshold {:.0}%)",
            report.success_rate() * 100.0,
            config.rebuild_min_success_rate * 100.0
        );
    }
    Ok(())
}

async fn run_rebuild_all(
    engine: &Engine,
    config: &AppConfig,
    sensor_id: Option<String>,
    start: Option<String>,
    end: Option<String>,
    tier: &str,
) -> Result<()> {
    let tier = parse_tier(tier)?;
    let sensors = sensor_id.map(|s| vec![s]);
    let start = start.map(|s| parse_timestamp(&s)).transpose()?;
    let end = end.map(|s| parse_timestamp(&s)).transpose()?;

    let rebuilder = Rebuilder::new(
        engine.reader(),
        config.local_data_root.clone(),
        config.rebuild_minute_chunk_hours,
        config.rebuild_daily_chunk_days,
    );
    let reports = rebuilder.rebuild(sensors, start, end, tier).await.context("rebuild failed")?;

    let mut any_below_threshold = false;
    for (asset, sensor, report) in &reports {
        let meets = report.meets_threshold(config.rebuild_min_success_rate);
        any_below_threshold |= !meets;
        println!(
            "{asset}/{sensor}: {}/{} chunks succeeded ({:.1}%){}",
            report.chunks_succeeded,
            report.chunks_total,
            report.success_rate() * 100.0,
            if meets { "" } else { " BELOW THRESHOLD" }
        );
    }
    if reports.is_empty() {
        println!("no (asset, sensor) pairs discovered for rebuild");
    }
    if any_below_threshold {
        anyhow::bail!(
            "one or more (asset, sensor) rebuilds fell below the {:.0}% success threshold",
            config.rebuild_min_success_rate * 100.0
        );
    }
    Ok(())
}

async fn print_stats(engine: &Engine) -> Result<()> {
    let payload = serde_json::json!({
        "query_stats": engine.get_query_stats(),
        "storage_stats": engine.storage_stats(),
        "health": engine.health_report().await,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_validate(
    engine: &Engine,
    config: &AppConfig,
    sensor_id: &str,
    asset_id: &str,
    start: &str,
    end: &str,
) -> Result<()> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;

    let rebuilder = Rebuilder::new(
        engine.reader(),
        config.local_data_root.clone(),
        config.rebuild_minute_chunk_hours,
        config.rebuild_daily_chunk_days,
    );
    let aggregated = rebuilder
        .validate_aggregated_data(sensor_id, asset_id, start, end, Tier::Aggregated)
        .await
        .context("validation failed for the aggregated tier")?;
    let daily = rebuilder
        .validate_aggregated_data(sensor_id, asset_id, start, end, Tier::Daily)
        .await
        .context("validation failed for the daily tier")?;

    for report in [&aggregated, &daily] {
        println!(
            "{}: {}/{} partitions present ({:.1}% coverage)",
            report.tier.as_str(),
            report.present_partitions,
            report.expected_partitions,
            report.coverage_fraction() * 100.0
        );
    }
    Ok(())
}

async fn run_query_raw(
    engine: &Engine,
    sensors: Vec<String>,
    assets: Vec<String>,
    start: &str,
    end: &str,
) -> Result<()> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    let result = engine
        .query_raw(&sensors, &assets, start, end)
        .await
        .context("raw-engine query failed")?;

    print_query_result(&result);
    Ok(())
}

async fn run_query_aggregated(
    engine: &Engine,
    sensors: Vec<String>,
    assets: Vec<String>,
    start: &str,
    end: &str,
    aggregation: &str,
    max_datapoints: usize,
) -> Result<()> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    let aggregation = AggregationMethod::parse(aggregation);
    let result = engine
        .query_aggregated(&sensors, &assets, start, end, aggregation, max_datapoints)
        .await
        .context("aggregated-engine query failed")?;

    print_query_result(&result);
    Ok(())
}

fn print_query_result(result: &sensor_query_service::model::QueryResult) {
    println!(
        "tier={:?} rows={} truncated={} actual_end={}",
        result.tier_used,
        result.batch.row_count(),
        result.truncated,
        result.actual_end_time.to_rfc3339(),
    );
}

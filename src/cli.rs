use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-query-service",
    version,
    about = "Tiered time-series sensor measurement query service"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the health/stats poll loop until a shutdown signal arrives.
    Serve {
        #[arg(long, default_value_t = 30)]
        poll_interval_seconds: u64,
    },
    /// Rebuild one aggregation tier over a time range and exit.
    Rebuild {
        #[arg(long)]
        sensor_id: String,
        #[arg(long)]
        asset_id: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "aggregated")]
        tier: String,
    },
    /// Rebuild one aggregation tier across every discovered asset, with
    /// sensors and/or the time range resolved automatically when omitted.
    RebuildAll {
        #[arg(long)]
        sensor_id: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value = "aggregated")]
        tier: String,
    },
    /// Print current query/cache/backend statistics as JSON.
    Stats,
    /// Validate aggregated-tier coverage for a sensor/asset over a range.
    Validate {
        #[arg(long)]
        sensor_id: String,
        #[arg(long)]
        asset_id: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Run the raw-engine facade: fixed 1s interval, `last` aggregation,
    /// window pre-truncated to the point budget.
    QueryRaw {
        #[arg(long = "sensor", required = true)]
        sensors: Vec<String>,
        #[arg(long = "asset")]
        assets: Vec<String>,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Run the aggregated-engine facade: auto interval, reads the
    /// precomputed minute/daily tier directly, falls back to the general
    /// executor when no precomputed batch covers the window.
    QueryAggregated {
        #[arg(long = "sensor", required = true)]
        sensors: Vec<String>,
        #[arg(long = "asset")]
        assets: Vec<String>,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "avg")]
        aggregation: String,
        #[arg(long, default_value_t = 1000)]
        max_datapoints: usize,
    },
}

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use grid_query::execution::ProgressSink;
use grid_query::query::FilterValue;
use grid_query::{HybridQueryConfig, HybridQueryManager, QueryOptions, QuerySpec, RequestedResolution, TimeRange};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "grid-query")]
#[command(about = "Query 5-minute / 30-minute market telemetry through the hybrid query layer")]
struct Args {
    /// Dataset to read (generation, price, interconnector, demand, ...)
    #[arg(short = 't', long)]
    data_type: String,

    /// Inclusive start, RFC 3339 (e.g. 2024-06-01T00:00:00Z)
    #[arg(long, value_parser = parse_timestamp)]
    start: DateTime<Utc>,

    /// Exclusive end, RFC 3339
    #[arg(long, value_parser = parse_timestamp)]
    end: DateTime<Utc>,

    /// auto, fine (5min) or coarse (30min)
    #[arg(short, long, default_value = "auto")]
    resolution: RequestedResolution,

    /// Comma-separated projection
    #[arg(short, long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Value-set filter, `column=v1,v2` (repeatable)
    #[arg(short, long)]
    filter: Vec<String>,

    /// JSON config file (defaults and GRID_QUERY_* env vars otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the parquet store, overrides the config
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Run the query this many times (later runs should hit the cache)
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Give up waiting after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", raw, e))
}

/// Integers and booleans are typed, everything else is a string
fn parse_filter_value(raw: &str) -> FilterValue {
    if let Ok(i) = raw.parse::<i64>() {
        FilterValue::Int(i)
    } else if let Ok(b) = raw.parse::<bool>() {
        FilterValue::Bool(b)
    } else {
        FilterValue::Str(raw.to_string())
    }
}

fn build_spec(args: &Args) -> Result<QuerySpec> {
    let mut spec = QuerySpec::new(&args.data_type, TimeRange::new(args.start, args.end))
        .with_resolution(args.resolution);

    if !args.columns.is_empty() {
        spec = spec.with_columns(args.columns.iter().map(|c| c.trim()));
    }

    for filter in &args.filter {
        let (column, values) = filter
            .split_once('=')
            .ok_or_else(|| anyhow!("filter '{}' must look like column=v1,v2", filter))?;
        let values: Vec<FilterValue> = values
            .split(',')
            .map(|v| parse_filter_value(v.trim()))
            .collect();
        spec = spec.with_filter(column.trim(), values);
    }

    Ok(spec)
}

fn load_config(args: &Args) -> Result<HybridQueryConfig> {
    let mut config = match &args.config {
        Some(path) => HybridQueryConfig::from_file(path)?.with_env_overrides()?,
        None => HybridQueryConfig::from_env()?,
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args).context("loading configuration")?;
    info!("Reading market data from {}", config.data_dir.display());

    let manager = HybridQueryManager::with_parquet_store(config)?;
    let spec = build_spec(&args)?;

    let progress: ProgressSink = Arc::new(|percent: u8| info!("Progress: {}%", percent));
    let mut options = QueryOptions::default().with_progress(progress);
    if let Some(ms) = args.deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }

    for run in 1..=args.repeat.max(1) {
        let response = manager.query_with(&spec, options.clone()).await?;

        if run == 1 {
            println!("\n=== {} ===", spec.data_type());
            println!("{}", response.table);
        }
        println!("\n=== Run {} metadata ===", run);
        println!("{}", serde_json::to_string_pretty(&response.metadata)?);
    }

    let stats = manager.cache_stats();
    println!("\n=== Cache ===");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("hit ratio: {:.2}", stats.hit_ratio());

    Ok(())
}

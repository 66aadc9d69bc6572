//! Parquet Storage Engine
//!
//! Reads the two resolutions of market telemetry from parquet files laid out
//! as `<data_dir>/<5min|30min>/<data_type>.parquet`, or as a directory of
//! parquet parts `<data_dir>/<5min|30min>/<data_type>/*.parquet`.
//! Scans are built as polars lazy plans so the time range and value filters
//! are pushed down into the parquet reader.

use crate::error::{QueryError, Result};
use crate::execution::engine::{ScanRequest, StorageEngine};
use crate::query::spec::{AggFn, FilterValue, Resolution};
use async_trait::async_trait;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Polars-backed parquet store
pub struct ParquetStore {
    data_dir: PathBuf,
}

impl ParquetStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the single-file layout for a dataset
    pub fn file_path(&self, data_type: &str, resolution: Resolution) -> PathBuf {
        self.data_dir
            .join(resolution.dir_name())
            .join(format!("{}.parquet", data_type))
    }

    /// Locate the parquet source (file or glob) for a dataset
    fn resolve_source(&self, data_type: &str, resolution: Resolution) -> Result<PathBuf> {
        if data_type.is_empty()
            || !data_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(QueryError::Storage(format!(
                "invalid dataset name '{}'",
                data_type
            )));
        }

        let file = self.file_path(data_type, resolution);
        if file.is_file() {
            return Ok(file);
        }

        let dir = self.data_dir.join(resolution.dir_name()).join(data_type);
        if dir.is_dir() {
            return Ok(dir.join("*.parquet"));
        }

        Err(QueryError::Storage(format!(
            "no {} data for '{}': {} not found",
            resolution,
            data_type,
            file.display()
        )))
    }

    /// Build the lazy plan for a scan (without collecting it)
    fn build_plan(&self, request: &ScanRequest) -> Result<LazyFrame> {
        let source = self.resolve_source(&request.data_type, request.resolution)?;

        let time = col(request.time_column.as_str());
        let mut plan = LazyFrame::scan_parquet(&source, ScanArgsParquet::default())
            .map_err(|e| {
                QueryError::Storage(format!("Failed to scan parquet {:?}: {}", source, e))
            })?
            .filter(
                time.clone()
                    .gt_eq(lit(request.start))
                    .and(time.lt(lit(request.end))),
            );

        for (column, values) in &request.filters {
            plan = plan.filter(value_set_expr(column, values));
        }

        if !request.columns.is_empty() {
            let projection: Vec<Expr> = request.columns.iter().map(|c| col(c.as_str())).collect();
            plan = plan.select(projection);
        }

        if let Some(aggregation) = &request.aggregation {
            let aggs: Vec<Expr> = aggregation
                .aggregates
                .iter()
                .map(|(column, func)| aggregate_expr(column, *func))
                .collect();

            plan = if aggregation.group_by.is_empty() {
                plan.select(aggs)
            } else {
                let keys: Vec<Expr> = aggregation.group_by.iter().map(|c| col(c.as_str())).collect();
                plan.group_by_stable(keys).agg(aggs)
            };
        }

        if let Some(slice) = request.slice {
            let len = IdxSize::try_from(slice.len).unwrap_or(IdxSize::MAX);
            plan = plan.slice(slice.offset as i64, len);
        }

        Ok(plan)
    }
}

/// OR of equalities, one per allowed value
fn value_set_expr(column: &str, values: &BTreeSet<FilterValue>) -> Expr {
    values
        .iter()
        .map(|value| {
            let value = match value {
                FilterValue::Bool(b) => lit(*b),
                FilterValue::Int(i) => lit(*i),
                FilterValue::Str(s) => lit(s.clone()),
            };
            col(column).eq(value)
        })
        .reduce(|acc, cond| acc.or(cond))
        .unwrap_or(lit(false))
}

fn aggregate_expr(column: &str, func: AggFn) -> Expr {
    let expr = col(column);
    let expr = match func {
        AggFn::Sum => expr.sum(),
        AggFn::Mean => expr.mean(),
        AggFn::Min => expr.min(),
        AggFn::Max => expr.max(),
        AggFn::Count => expr.count(),
        AggFn::First => expr.first(),
        AggFn::Last => expr.last(),
    };
    expr.alias(column)
}

async fn collect_blocking(plan: LazyFrame) -> Result<DataFrame> {
    tokio::task::spawn_blocking(move || plan.collect())
        .await
        .map_err(|e| QueryError::Storage(format!("Parquet scan task failed: {}", e)))?
        .map_err(|e| {
            warn!("Parquet scan failed: {}", e);
            QueryError::from(e)
        })
}

#[async_trait]
impl StorageEngine for ParquetStore {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn execute(&self, request: &ScanRequest) -> Result<DataFrame> {
        let plan = self.build_plan(request)?;
        let df = collect_blocking(plan).await?;
        debug!(
            "Scanned {} {} rows of '{}' (slice {:?})",
            df.height(),
            request.resolution,
            request.data_type,
            request.slice
        );
        Ok(df)
    }

    async fn row_count(&self, request: &ScanRequest) -> Result<Option<usize>> {
        let mut unsliced = request.clone();
        unsliced.slice = None;
        let plan = self.build_plan(&unsliced)?.select([len().alias("count")]);
        let count_df = collect_blocking(plan).await?;

        let count = count_df
            .column("count")?
            .cast(&DataType::UInt64)?
            .u64()?
            .get(0)
            .map(|c| c as usize);
        Ok(count)
    }
}

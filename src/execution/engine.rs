//! Storage Engine Trait - contract for the columnar store behind the query layer
//!
//! Engines execute a structured scan and return a materialised polars
//! `DataFrame`. Streaming is expressed as a [`BatchCursor`]; engines without a
//! native cursor get [`SliceCursor`], which pages through the result with
//! row slices.

use crate::error::Result;
use crate::query::spec::{Aggregation, FilterValue, QuerySpec, Resolution};
use async_trait::async_trait;
use polars::prelude::DataFrame;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Row window of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSlice {
    pub offset: usize,
    pub len: usize,
}

/// Structured scan handed to the storage engine
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub data_type: String,
    pub resolution: Resolution,

    /// Int64 epoch-seconds column the time range applies to
    pub time_column: String,

    /// Inclusive start, epoch seconds
    pub start: i64,

    /// Exclusive end, epoch seconds
    pub end: i64,

    /// Projection (empty = all columns)
    pub columns: Vec<String>,

    /// Column -> allowed values
    pub filters: BTreeMap<String, BTreeSet<FilterValue>>,

    pub aggregation: Option<Aggregation>,

    /// Only return this window of the final result
    pub slice: Option<RowSlice>,
}

impl ScanRequest {
    /// Build a scan from a spec already normalised to `resolution`
    pub fn from_spec(spec: &QuerySpec, resolution: Resolution, time_column: &str) -> Self {
        let mut columns = spec.columns().to_vec();
        columns.sort();
        Self {
            data_type: spec.data_type().to_string(),
            resolution,
            time_column: time_column.to_string(),
            start: spec.time_range().start().timestamp(),
            end: spec.time_range().end().timestamp(),
            columns,
            filters: spec.filters().clone(),
            aggregation: spec.aggregation().cloned(),
            slice: None,
        }
    }

    pub fn with_slice(&self, offset: usize, len: usize) -> Self {
        let mut request = self.clone();
        request.slice = Some(RowSlice { offset, len });
        request
    }
}

/// Columnar storage engine - all engines must implement this
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Engine name (e.g. "parquet")
    fn name(&self) -> &'static str;

    /// Execute a scan and return the whole (or sliced) result
    async fn execute(&self, request: &ScanRequest) -> Result<DataFrame>;

    /// Rows the scan would return, when the engine can tell cheaply
    async fn row_count(&self, _request: &ScanRequest) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Native streaming cursor, if the engine has one
    async fn open_cursor(
        &self,
        _request: &ScanRequest,
        _batch_rows: usize,
    ) -> Result<Option<Box<dyn BatchCursor>>> {
        Ok(None)
    }
}

/// Ordered stream of row batches from one scan
#[async_trait]
pub trait BatchCursor: Send {
    /// Next batch, or `None` once the scan is exhausted
    async fn next_batch(&mut self) -> Result<Option<DataFrame>>;

    /// Release engine-side resources early
    async fn close(&mut self) {}
}

/// Cursor that pages through a scan with successive row slices
pub struct SliceCursor {
    engine: Arc<dyn StorageEngine>,
    request: ScanRequest,
    batch_rows: usize,
    offset: usize,
    yielded: bool,
    exhausted: bool,
}

impl SliceCursor {
    pub fn new(engine: Arc<dyn StorageEngine>, request: ScanRequest, batch_rows: usize) -> Self {
        Self {
            engine,
            request,
            batch_rows: batch_rows.max(1),
            offset: 0,
            yielded: false,
            exhausted: false,
        }
    }
}

#[async_trait]
impl BatchCursor for SliceCursor {
    async fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        if self.exhausted {
            return Ok(None);
        }

        let batch = self
            .engine
            .execute(&self.request.with_slice(self.offset, self.batch_rows))
            .await?;
        let rows = batch.height();
        self.offset += rows;

        if rows < self.batch_rows {
            self.exhausted = true;
        }

        // The first batch is returned even when empty so callers see the schema
        if rows == 0 && self.yielded {
            return Ok(None);
        }

        self.yielded = true;
        Ok(Some(batch))
    }

    async fn close(&mut self) {
        self.exhausted = true;
    }
}

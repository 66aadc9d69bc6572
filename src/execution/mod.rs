//! Execution Module
//!
//! Storage engine contract, the polars parquet store, and the executor that
//! runs scans whole or in progress-reporting chunks.

pub mod chunked;
pub mod engine;
pub mod parquet_engine;

pub use chunked::{Chunk, ChunkSink, ChunkedExecution, ExecutionState, ProgressSink, QueryExecutor};
pub use engine::{BatchCursor, RowSlice, ScanRequest, SliceCursor, StorageEngine};
pub use parquet_engine::ParquetStore;

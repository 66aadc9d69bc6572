//! Chunked Query Execution
//!
//! Runs a scan either as one materialised call or as an ordered stream of
//! bounded-size chunks with progress reporting. The chunked path bounds the
//! transient memory used while the result is assembled; the assembled table
//! still ends up at full size.

use crate::error::{QueryError, Result};
use crate::execution::engine::{BatchCursor, ScanRequest, SliceCursor, StorageEngine};
use crate::query::spec::TimeRange;
use crate::resolution::estimator::MemoryEstimator;
use chrono::{TimeZone, Utc};
use polars::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives completion percentages (0-100) of a chunked execution.
/// Must return quickly; the executor does not wait on it.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// Receives every chunk as it is produced
pub type ChunkSink = Arc<dyn Fn(&Chunk) + Send + Sync>;

/// One ordered row batch of a chunked execution
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 0-based, gapless
    pub sequence: usize,
    pub rows: usize,
    pub data: DataFrame,
    /// Set on the last chunk of the execution
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Streaming,
    Complete,
    Failed,
}

/// Runs scans against a storage engine
pub struct QueryExecutor {
    engine: Arc<dyn StorageEngine>,
    estimator: Arc<MemoryEstimator>,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn StorageEngine>, estimator: Arc<MemoryEstimator>) -> Self {
        Self { engine, estimator }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Whole-result path: one engine call. An empty result is a zero-row
    /// table, not an error.
    pub async fn execute(&self, request: &ScanRequest) -> Result<DataFrame> {
        debug!(
            "Executing {} scan of '{}' on {}",
            request.resolution,
            request.data_type,
            self.engine.name()
        );
        self.engine.execute(request).await
    }

    /// Large-result path: stream the scan in chunks of about `chunk_row_target`
    /// rows and assemble them in order.
    pub async fn execute_chunked(
        &self,
        request: &ScanRequest,
        chunk_row_target: usize,
        on_progress: Option<ProgressSink>,
    ) -> Result<DataFrame> {
        let mut execution = self.chunked(request.clone(), chunk_row_target);
        if let Some(sink) = on_progress {
            execution = execution.on_progress(sink);
        }
        execution.run().await
    }

    /// Prepare a chunked execution without starting it
    pub fn chunked(&self, request: ScanRequest, chunk_row_target: usize) -> ChunkedExecution {
        ChunkedExecution {
            engine: self.engine.clone(),
            estimator: self.estimator.clone(),
            request,
            chunk_row_target: chunk_row_target.max(1),
            on_progress: None,
            on_chunk: None,
            state: ExecutionState::Pending,
        }
    }
}

/// A single chunked run. Moves `Pending -> Streaming -> Complete | Failed`
/// and cannot be run twice.
pub struct ChunkedExecution {
    engine: Arc<dyn StorageEngine>,
    estimator: Arc<MemoryEstimator>,
    request: ScanRequest,
    chunk_row_target: usize,
    on_progress: Option<ProgressSink>,
    on_chunk: Option<ChunkSink>,
    state: ExecutionState,
}

impl ChunkedExecution {
    pub fn on_progress(mut self, sink: ProgressSink) -> Self {
        self.on_progress = Some(sink);
        self
    }

    pub fn on_chunk(mut self, sink: ChunkSink) -> Self {
        self.on_chunk = Some(sink);
        self
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Rows the scan is expected to return, from the engine when it knows,
    /// otherwise from the static estimate
    async fn expected_rows(&self) -> usize {
        match self.engine.row_count(&self.request).await {
            Ok(Some(rows)) => rows,
            Ok(None) => self.estimated_rows(),
            Err(e) => {
                debug!("Row count unavailable ({}), using estimate", e);
                self.estimated_rows()
            }
        }
    }

    fn estimated_rows(&self) -> usize {
        let range = TimeRange::new(
            Utc.timestamp_opt(self.request.start, 0)
                .single()
                .unwrap_or_default(),
            Utc.timestamp_opt(self.request.end, 0)
                .single()
                .unwrap_or_default(),
        );
        self.estimator
            .estimate_rows(&range, self.request.resolution, &self.request.data_type)
            as usize
    }

    pub async fn run(&mut self) -> Result<DataFrame> {
        if self.state != ExecutionState::Pending {
            return Err(QueryError::Storage(
                "chunked execution has already been run".to_string(),
            ));
        }

        match self.stream().await {
            Ok(df) => {
                self.state = ExecutionState::Complete;
                Ok(df)
            }
            Err(e) => {
                warn!(
                    "Chunked scan of '{}' failed: {}",
                    self.request.data_type, e
                );
                self.state = ExecutionState::Failed;
                Err(e)
            }
        }
    }

    async fn stream(&mut self) -> Result<DataFrame> {
        let expected = self.expected_rows().await.max(1);

        let mut cursor: Box<dyn BatchCursor> = match self
            .engine
            .open_cursor(&self.request, self.chunk_row_target)
            .await?
        {
            Some(cursor) => cursor,
            None => Box::new(SliceCursor::new(
                self.engine.clone(),
                self.request.clone(),
                self.chunk_row_target,
            )),
        };

        let mut progress = ProgressTracker::new(expected, self.on_progress.clone());
        let mut accumulator: Option<DataFrame> = None;
        let mut sequence = 0;
        // One batch of lookahead so the last chunk can be marked terminal
        let mut pending: Option<DataFrame> = None;

        loop {
            let next = match cursor.next_batch().await {
                Ok(next) => next,
                Err(e) => {
                    cursor.close().await;
                    return Err(e);
                }
            };

            if next.is_some() && self.state == ExecutionState::Pending {
                debug!(
                    "Streaming '{}' in chunks of {} rows (expecting ~{} rows)",
                    self.request.data_type, self.chunk_row_target, expected
                );
                self.state = ExecutionState::Streaming;
            }

            let terminal = next.is_none();
            if let Some(data) = pending.take() {
                let chunk = Chunk {
                    sequence,
                    rows: data.height(),
                    data,
                    terminal,
                };
                sequence += 1;

                if let Some(sink) = &self.on_chunk {
                    sink(&chunk);
                }
                progress.advance(chunk.rows, chunk.terminal);

                match accumulator.as_mut() {
                    Some(acc) => {
                        if let Err(e) = acc.vstack_mut(&chunk.data) {
                            cursor.close().await;
                            return Err(e.into());
                        }
                    }
                    None => accumulator = Some(chunk.data),
                }
            }

            match next {
                Some(batch) => pending = Some(batch),
                None => break,
            }
        }

        let mut table = match accumulator {
            Some(table) => table,
            // The cursor produced nothing at all; ask for an empty slice to get the schema
            None => {
                let empty = self.engine.execute(&self.request.with_slice(0, 0)).await?;
                progress.advance(0, true);
                empty
            }
        };
        table.as_single_chunk_par();

        debug!(
            "Assembled {} rows of '{}' from {} chunks",
            table.height(),
            self.request.data_type,
            sequence
        );
        Ok(table)
    }
}

/// Monotonic, clamped progress reporting. Only the terminal chunk reports 100.
struct ProgressTracker {
    expected_rows: usize,
    rows_done: usize,
    last: u8,
    sink: Option<ProgressSink>,
}

impl ProgressTracker {
    fn new(expected_rows: usize, sink: Option<ProgressSink>) -> Self {
        Self {
            expected_rows: expected_rows.max(1),
            rows_done: 0,
            last: 0,
            sink,
        }
    }

    fn advance(&mut self, rows: usize, terminal: bool) {
        self.rows_done += rows;
        let percent = if terminal {
            100
        } else {
            let raw = (self.rows_done as u128 * 100) / self.expected_rows as u128;
            raw.min(99) as u8
        };
        self.last = self.last.max(percent);
        if let Some(sink) = &self.sink {
            sink(self.last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::spec::Resolution;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory engine over a fixed frame; optionally fails after N slices
    struct FrameEngine {
        frame: DataFrame,
        reported_rows: Option<usize>,
        fail_after: Option<usize>,
        calls: AtomicUsize,
    }

    impl FrameEngine {
        fn new(rows: usize) -> Self {
            let ts: Vec<i64> = (0..rows as i64).map(|i| i * 300).collect();
            let values: Vec<f64> = (0..rows).map(|i| i as f64).collect();
            Self {
                frame: df!["timestamp" => ts, "scada_value" => values].unwrap(),
                reported_rows: Some(rows),
                fail_after: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageEngine for FrameEngine {
        fn name(&self) -> &'static str {
            "frame"
        }

        async fn execute(&self, request: &ScanRequest) -> Result<DataFrame> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if call >= limit {
                    return Err(QueryError::Storage("disk went away".to_string()));
                }
            }
            Ok(match request.slice {
                Some(slice) => self.frame.slice(slice.offset as i64, slice.len),
                None => self.frame.clone(),
            })
        }

        async fn row_count(&self, _request: &ScanRequest) -> Result<Option<usize>> {
            Ok(self.reported_rows)
        }
    }

    fn request() -> ScanRequest {
        ScanRequest {
            data_type: "generation".to_string(),
            resolution: Resolution::Fine,
            time_column: "timestamp".to_string(),
            start: 0,
            end: 86_400,
            columns: Vec::new(),
            filters: Default::default(),
            aggregation: None,
            slice: None,
        }
    }

    fn executor(engine: FrameEngine) -> QueryExecutor {
        QueryExecutor::new(Arc::new(engine), Arc::new(MemoryEstimator::default()))
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<u8>>>) {
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (Arc::new(move |p: u8| sink_seen.lock().push(p)), seen)
    }

    #[tokio::test]
    async fn test_chunks_reassemble_the_whole_result() {
        let executor = executor(FrameEngine::new(1_000));
        let whole = executor.execute(&request()).await.unwrap();
        let chunked = executor.execute_chunked(&request(), 128, None).await.unwrap();
        assert!(whole.equals(&chunked));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let executor = executor(FrameEngine::new(1_000));
        let (sink, seen) = recording_sink();
        executor
            .execute_chunked(&request(), 100, Some(sink))
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100);
        assert!(seen[..seen.len() - 1].iter().all(|p| *p < 100));
    }

    #[tokio::test]
    async fn test_underestimated_row_count_is_clamped() {
        let mut engine = FrameEngine::new(500);
        engine.reported_rows = Some(50);
        let executor = executor(engine);
        let (sink, seen) = recording_sink();
        executor
            .execute_chunked(&request(), 100, Some(sink))
            .await
            .unwrap();

        let seen = seen.lock();
        assert!(seen[..seen.len() - 1].iter().all(|p| *p == 99));
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_chunk_sequence_is_gapless_with_one_terminal() {
        let executor = executor(FrameEngine::new(250));
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink_chunks = chunks.clone();
        let mut execution = executor
            .chunked(request(), 100)
            .on_chunk(Arc::new(move |c: &Chunk| {
                sink_chunks.lock().push((c.sequence, c.rows, c.terminal))
            }));

        assert_eq!(execution.state(), ExecutionState::Pending);
        execution.run().await.unwrap();
        assert_eq!(execution.state(), ExecutionState::Complete);

        assert_eq!(
            *chunks.lock(),
            vec![(0, 100, false), (1, 100, false), (2, 50, true)]
        );

        // Executions are single-use
        assert!(execution.run().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_result_keeps_schema() {
        let executor = executor(FrameEngine::new(0));
        let (sink, seen) = recording_sink();
        let df = executor
            .execute_chunked(&request(), 100, Some(sink))
            .await
            .unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.get_column_names(), &["timestamp", "scada_value"]);
        assert_eq!(*seen.lock(), vec![100]);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_everything() {
        let mut engine = FrameEngine::new(1_000);
        engine.fail_after = Some(3);
        let executor = executor(engine);
        let mut execution = executor.chunked(request(), 100);

        let err = execution.run().await.unwrap_err();
        assert!(matches!(err, QueryError::Storage(_)));
        assert_eq!(execution.state(), ExecutionState::Failed);
    }
}

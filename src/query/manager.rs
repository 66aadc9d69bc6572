//! Hybrid Query Manager
//!
//! Single entry point of the query layer. A query is validated, pinned to a
//! resolution, keyed, and then served from the result cache or computed by
//! the executor (whole or chunked, depending on its estimated size).

use crate::cache::{CacheStats, ComputeOptions, ResultCache, Table};
use crate::config::HybridQueryConfig;
use crate::error::{QueryError, Result};
use crate::execution::{ParquetStore, ProgressSink, QueryExecutor, ScanRequest, StorageEngine};
use crate::query::cache_key::CacheKey;
use crate::query::spec::QuerySpec;
use crate::resolution::{MemoryEstimator, ResolutionDecision, ResolutionSelector};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call options of [`HybridQueryManager::query_with`]
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Abandon the wait after this long. The computation itself keeps running
    /// and still populates the cache.
    pub deadline: Option<Duration>,

    /// Abandon the wait when fired; also aborts the storage call if this
    /// caller is the only one waiting on it
    pub cancel: Option<CancellationToken>,

    /// Receives progress percentages when the query runs chunked
    pub progress: Option<ProgressSink>,
}

impl QueryOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// How a query was answered
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub query_id: String,
    pub resolution_decision: ResolutionDecision,
    pub cache_hit: bool,
    pub bytes_estimated: u64,
    pub cache_key: String,
    /// The estimate routed the computation through the chunked path
    pub chunked: bool,
    pub row_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub table: Table,
    pub metadata: QueryMetadata,
}

/// A query pinned to a resolution, ready to be served
struct QueryPlan {
    decision: ResolutionDecision,
    key: CacheKey,
    request: ScanRequest,
    chunked: bool,
}

pub struct HybridQueryManager {
    config: HybridQueryConfig,
    estimator: Arc<MemoryEstimator>,
    selector: ResolutionSelector,
    executor: Arc<QueryExecutor>,
    cache: ResultCache,
}

impl HybridQueryManager {
    /// Manager over `engine` with a fresh cache sized from `config`
    pub fn new(config: HybridQueryConfig, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        let cache = ResultCache::new(config.cache_config());
        Self::with_cache(config, engine, cache)
    }

    /// Manager over the parquet store rooted at `config.data_dir`
    pub fn with_parquet_store(config: HybridQueryConfig) -> Result<Self> {
        let store = Arc::new(ParquetStore::new(config.data_dir.clone()));
        Self::new(config, store)
    }

    /// Manager sharing an existing cache
    pub fn with_cache(
        config: HybridQueryConfig,
        engine: Arc<dyn StorageEngine>,
        cache: ResultCache,
    ) -> Result<Self> {
        config.validate()?;

        let estimator = Arc::new(MemoryEstimator::new(config.data_types.clone()));
        let selector = ResolutionSelector::new(estimator.clone(), config.fine_threshold_bytes);
        let executor = Arc::new(QueryExecutor::new(engine, estimator.clone()));

        info!(
            "Hybrid query manager ready (engine: {}, cache budget: {} bytes, ttl: {}s)",
            executor.engine().name(),
            cache.config().budget_bytes,
            cache.config().ttl.as_secs()
        );

        Ok(Self {
            config,
            estimator,
            selector,
            executor,
            cache,
        })
    }

    pub fn config(&self) -> &HybridQueryConfig {
        &self.config
    }

    pub fn estimator(&self) -> &MemoryEstimator {
        &self.estimator
    }

    /// Run a query with default options
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryResponse> {
        self.query_with(spec, QueryOptions::default()).await
    }

    pub async fn query_with(&self, spec: &QuerySpec, options: QueryOptions) -> Result<QueryResponse> {
        let query_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let plan = self.plan(spec)?;
        info!(
            "[{}] '{}' at {} ({}, ~{} bytes{})",
            query_id,
            spec.data_type(),
            plan.decision.resolution,
            plan.decision.reason,
            plan.decision.estimated_bytes,
            if plan.chunked { ", chunked" } else { "" }
        );

        let executor = self.executor.clone();
        let request = plan.request.clone();
        let chunk_row_target = self.config.chunk_row_target;
        let progress = options.progress.clone();
        let chunked = plan.chunked;
        let compute = move || async move {
            if chunked {
                executor
                    .execute_chunked(&request, chunk_row_target, progress)
                    .await
            } else {
                executor.execute(&request).await
            }
        };

        let compute_options = ComputeOptions {
            data_type: Some(spec.data_type().to_string()),
            deadline: options.deadline,
            cancel: options.cancel,
        };

        let lookup = self
            .cache
            .get_or_compute_with(&plan.key, compute, &compute_options)
            .await
            .map_err(|e| {
                warn!("[{}] query of '{}' failed: {}", query_id, spec.data_type(), e);
                e
            })?;

        let table = self.restore_projection(spec, lookup.table)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            "[{}] {} rows in {}ms (cache {})",
            query_id,
            table.height(),
            elapsed_ms,
            if lookup.cache_hit { "hit" } else { "miss" }
        );

        Ok(QueryResponse {
            metadata: QueryMetadata {
                query_id,
                bytes_estimated: plan.decision.estimated_bytes,
                resolution_decision: plan.decision,
                cache_hit: lookup.cache_hit,
                cache_key: plan.key.to_string(),
                chunked: plan.chunked,
                row_count: table.height(),
                elapsed_ms,
            },
            table,
        })
    }

    /// Resolution the manager would use for `spec`, without running it
    pub fn resolve(&self, spec: &QuerySpec) -> Result<ResolutionDecision> {
        spec.validate()?;
        self.selector
            .decide(
                spec.resolution(),
                spec.time_range(),
                spec.data_type(),
                spec.columns(),
            )
            .map_err(|e| match e {
                QueryError::InvalidRange { .. } => QueryError::InvalidSpec(e.to_string()),
                other => other,
            })
    }

    fn plan(&self, spec: &QuerySpec) -> Result<QueryPlan> {
        let decision = self.resolve(spec)?;
        let resolution = decision.resolution;

        let key = CacheKey::for_query(spec, resolution);
        let time_column = &self.estimator.profile(spec.data_type()).time_column;
        let request = ScanRequest::from_spec(&spec.normalized_for(resolution), resolution, time_column);
        let chunked = decision.estimated_bytes > self.config.chunking_threshold_bytes;

        Ok(QueryPlan {
            decision,
            key,
            request,
            chunked,
        })
    }

    /// Scans project columns in sorted order so that the cache key is
    /// order-independent; hand back the caller's order
    fn restore_projection(&self, spec: &QuerySpec, table: Table) -> Result<Table> {
        if spec.aggregation().is_some() || spec.columns().is_empty() {
            return Ok(table);
        }

        let in_order = table
            .get_column_names()
            .iter()
            .zip(spec.columns())
            .all(|(have, want)| *have == want.as_str());
        if in_order {
            return Ok(table);
        }

        let projected = table.select(spec.columns().iter().map(|c| c.as_str()))?;
        Ok(Arc::new(projected))
    }

    /// Drop the cached result for `spec`; returns whether one was cached
    pub fn invalidate(&self, spec: &QuerySpec) -> Result<bool> {
        let decision = self.resolve(spec)?;
        Ok(self
            .cache
            .invalidate(&CacheKey::for_query(spec, decision.resolution)))
    }

    /// Drop every cached result of one dataset, e.g. after new data lands
    pub fn invalidate_data_type(&self, data_type: &str) -> usize {
        let removed = self.cache.invalidate_data_type(data_type);
        info!("Invalidated {} cached results for '{}'", removed, data_type);
        removed
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Evict expired results now instead of on their next lookup
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

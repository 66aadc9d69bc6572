//! Query Result Cache
//!
//! Process-local cache of materialised query results:
//! - at most one computation per key at a time (singleflight)
//! - TTL expiry, checked lazily on lookup
//! - byte budget enforced by least-recently-accessed eviction
//!
//! Each key lives in one `DashMap` slot that is either a ready entry or a
//! pending computation, so "look up, else register as owner" happens under a
//! single shard lock. Inserts that may evict take a short global lock to scan
//! for LRU candidates.

use crate::error::{QueryError, Result};
use crate::query::cache_key::CacheKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Immutable handle to a cached result
pub type Table = Arc<DataFrame>;

/// Measures an entry's cost against the byte budget
pub type Weigher = Arc<dyn Fn(&DataFrame) -> u64 + Send + Sync>;

type Outcome = Result<Table>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total bytes the cache may hold
    pub budget_bytes: u64,
    /// Lifetime of an entry from its creation
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024,
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Per-call options for [`ResultCache::get_or_compute_with`]
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Dataset the result belongs to, used by [`ResultCache::invalidate_data_type`]
    pub data_type: Option<String>,
    /// Give up waiting after this long; the computation keeps running
    pub deadline: Option<Duration>,
    /// Abandon the wait; aborts the computation when this caller is its only waiter
    pub cancel: Option<CancellationToken>,
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub table: Table,
    pub cache_hit: bool,
}

/// Snapshot of cache counters and occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    /// Callers that joined a computation already in flight
    pub coalesced_count: u64,
    pub eviction_count: u64,
    pub current_bytes: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count + self.coalesced_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

struct CacheEntry {
    table: Table,
    size_bytes: u64,
    data_type: Option<String>,
    created_at: Instant,
    created_tick: u64,
    last_access_tick: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// A computation in progress for one key
struct InFlight {
    id: u64,
    data_type: Option<String>,
    tx: watch::Sender<Option<Outcome>>,
    /// Callers currently waiting, the owner included
    waiters: AtomicUsize,
    abort: OnceLock<AbortHandle>,
    /// Cleared by invalidation: the result is still delivered but not cached
    cacheable: AtomicBool,
}

enum Slot {
    Ready(CacheEntry),
    Pending(Arc<InFlight>),
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    current_bytes: AtomicU64,
    entries: AtomicU64,
}

struct Inner {
    config: CacheConfig,
    weigher: Weigher,
    slots: DashMap<CacheKey, Slot>,
    /// Serialises inserts and their eviction sweeps
    insert_lock: Mutex<()>,
    counters: Counters,
    /// Logical clock for LRU ordering
    tick: AtomicU64,
    next_flight: AtomicU64,
}

enum Role {
    Hit(Table),
    Owner(Arc<InFlight>),
    Waiter(Arc<InFlight>),
}

/// Process-local result cache; cheap to clone, clones share state
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl ResultCache {
    /// Cache weighing entries by their estimated in-memory size
    pub fn new(config: CacheConfig) -> Self {
        Self::with_weigher(config, Arc::new(|df: &DataFrame| df.estimated_size() as u64))
    }

    pub fn with_weigher(config: CacheConfig, weigher: Weigher) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                weigher,
                slots: DashMap::new(),
                insert_lock: Mutex::new(()),
                counters: Counters::default(),
                tick: AtomicU64::new(0),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the cached table for `key`, or run `compute` to produce it.
    ///
    /// Concurrent callers for the same key share one computation; `compute`
    /// is only invoked by the caller that registers it. Failures reach every
    /// waiter and are never cached.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DataFrame>> + Send + 'static,
    {
        self.get_or_compute_with(key, compute, &ComputeOptions::default())
            .await
    }

    pub async fn get_or_compute_with<F, Fut>(
        &self,
        key: &CacheKey,
        compute: F,
        options: &ComputeOptions,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DataFrame>> + Send + 'static,
    {
        match self.acquire(key, options.data_type.as_deref()) {
            Role::Hit(table) => {
                debug!("Cache hit for {}", key.short());
                Ok(CacheLookup {
                    table,
                    cache_hit: true,
                })
            }
            Role::Waiter(flight) => {
                debug!("Joining in-flight computation for {}", key.short());
                let table = self.wait(key, flight, false, options).await?;
                Ok(CacheLookup {
                    table,
                    cache_hit: false,
                })
            }
            Role::Owner(flight) => {
                debug!("Cache miss for {}, computing", key.short());
                self.spawn_computation(key.clone(), flight.clone(), compute());
                let table = self.wait(key, flight, true, options).await?;
                Ok(CacheLookup {
                    table,
                    cache_hit: false,
                })
            }
        }
    }

    /// Look up `key` and, on a miss, register a new in-flight computation,
    /// all under the key's shard lock
    fn acquire(&self, key: &CacheKey, data_type: Option<&str>) -> Role {
        let inner = &self.inner;
        let now = Instant::now();

        match inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let expired_size = match occupied.get_mut() {
                    Slot::Ready(entry) if !entry.is_expired(now) => {
                        entry.last_access_tick = inner.next_tick();
                        inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Role::Hit(entry.table.clone());
                    }
                    Slot::Ready(entry) => entry.size_bytes,
                    Slot::Pending(flight) => {
                        flight.waiters.fetch_add(1, Ordering::SeqCst);
                        inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return Role::Waiter(flight.clone());
                    }
                };

                debug!("Cache entry {} expired", key.short());
                let flight = inner.new_flight(data_type);
                occupied.insert(Slot::Pending(flight.clone()));
                inner.release(expired_size);
                inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                Role::Owner(flight)
            }
            Entry::Vacant(vacant) => {
                let flight = inner.new_flight(data_type);
                vacant.insert(Slot::Pending(flight.clone()));
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                Role::Owner(flight)
            }
        }
    }

    /// Run the computation on its own task so that callers giving up their
    /// wait do not cancel it
    fn spawn_computation<Fut>(&self, key: CacheKey, flight: Arc<InFlight>, computation: Fut)
    where
        Fut: Future<Output = Result<DataFrame>> + Send + 'static,
    {
        let mut guard = FlightGuard {
            inner: self.inner.clone(),
            key,
            flight: flight.clone(),
            finished: false,
        };
        let handle = tokio::spawn(async move {
            let outcome = computation.await.map(Arc::new);
            guard.finish(outcome);
        });
        let _ = flight.abort.set(handle.abort_handle());
    }

    async fn wait(
        &self,
        key: &CacheKey,
        flight: Arc<InFlight>,
        is_owner: bool,
        options: &ComputeOptions,
    ) -> Result<Table> {
        let _waiter = WaiterGuard(flight.clone());
        let mut rx = flight.tx.subscribe();

        let result = async {
            match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => (*outcome).clone().unwrap_or(Err(QueryError::Cancelled)),
                Err(_) => Err(QueryError::Cancelled),
            }
        };

        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let deadline = async {
            match options.deadline {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending::<Duration>().await,
            }
        };

        tokio::select! {
            biased;
            outcome = result => outcome,
            _ = cancelled => {
                if is_owner {
                    self.abort_if_sole_waiter(key, &flight);
                }
                Err(QueryError::Cancelled)
            }
            limit = deadline => Err(QueryError::DeadlineExceeded(limit)),
        }
    }

    /// Abort the computation behind `flight` if no other caller is waiting on
    /// it. The pending slot is removed under the shard lock that `acquire`
    /// joins through, so nobody can attach to an aborted computation.
    fn abort_if_sole_waiter(&self, key: &CacheKey, flight: &InFlight) {
        let removed = self.inner.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::Pending(f)
                if f.id == flight.id && f.waiters.load(Ordering::SeqCst) == 1)
        });
        if removed.is_some() {
            if let Some(handle) = flight.abort.get() {
                debug!("Sole owner cancelled, aborting computation for {}", key.short());
                handle.abort();
            }
        }
    }

    /// Drop the entry for `key` regardless of its TTL. A computation in flight
    /// for the key still completes but its result is not cached.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let occupied = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied,
            Entry::Vacant(_) => return false,
        };

        let pending = match occupied.get() {
            Slot::Pending(flight) => {
                flight.cacheable.store(false, Ordering::SeqCst);
                true
            }
            Slot::Ready(_) => false,
        };
        if pending {
            return false;
        }

        if let Slot::Ready(entry) = occupied.remove() {
            self.inner.release(entry.size_bytes);
            debug!("Invalidated cache entry {}", key.short());
        }
        true
    }

    /// Drop every entry of one dataset; returns how many were removed
    pub fn invalidate_data_type(&self, data_type: &str) -> usize {
        let inner = &self.inner;
        let mut removed = 0;
        inner.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) if entry.data_type.as_deref() == Some(data_type) => {
                inner.release(entry.size_bytes);
                removed += 1;
                false
            }
            Slot::Pending(flight) if flight.data_type.as_deref() == Some(data_type) => {
                flight.cacheable.store(false, Ordering::SeqCst);
                true
            }
            _ => true,
        });
        debug!("Invalidated {} cache entries for '{}'", removed, data_type);
        removed
    }

    /// Remove all entries
    pub fn clear(&self) {
        let inner = &self.inner;
        inner.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => {
                inner.release(entry.size_bytes);
                false
            }
            Slot::Pending(flight) => {
                flight.cacheable.store(false, Ordering::SeqCst);
                true
            }
        });
    }

    /// Evict every entry whose TTL has elapsed; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let inner = &self.inner;
        let now = Instant::now();
        let mut removed = 0;
        inner.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) if entry.is_expired(now) => {
                inner.release(entry.size_bytes);
                inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                removed += 1;
                false
            }
            _ => true,
        });
        removed
    }

    /// Whether a live entry exists for `key`
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.inner
            .slots
            .get(key)
            .map(|slot| matches!(&*slot, Slot::Ready(entry) if !entry.is_expired(now)))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hit_count: c.hits.load(Ordering::Relaxed),
            miss_count: c.misses.load(Ordering::Relaxed),
            coalesced_count: c.coalesced.load(Ordering::Relaxed),
            eviction_count: c.evictions.load(Ordering::Relaxed),
            current_bytes: c.current_bytes.load(Ordering::Relaxed),
            entry_count: c.entries.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn new_flight(&self, data_type: Option<&str>) -> Arc<InFlight> {
        let (tx, _) = watch::channel(None);
        Arc::new(InFlight {
            id: self.next_flight.fetch_add(1, Ordering::SeqCst),
            data_type: data_type.map(str::to_string),
            tx,
            waiters: AtomicUsize::new(1),
            abort: OnceLock::new(),
            cacheable: AtomicBool::new(true),
        })
    }

    /// Account for a ready entry leaving the cache
    fn release(&self, size_bytes: u64) {
        self.counters
            .current_bytes
            .fetch_sub(size_bytes, Ordering::SeqCst);
        self.counters.entries.fetch_sub(1, Ordering::SeqCst);
    }

    fn remove_pending(&self, key: &CacheKey, flight_id: u64) {
        self.slots.remove_if(
            key,
            |_, slot| matches!(slot, Slot::Pending(f) if f.id == flight_id),
        );
    }

    /// Turn the pending slot for `key` into a ready entry, evicting LRU
    /// entries first if the budget requires it
    fn store(&self, key: &CacheKey, flight: &InFlight, table: Table) {
        let size_bytes = (self.weigher)(&*table);
        let _insert = self.insert_lock.lock();

        if size_bytes > self.config.budget_bytes {
            debug!(
                "Result for {} ({} bytes) exceeds the cache budget, not caching",
                key.short(),
                size_bytes
            );
            self.remove_pending(key, flight.id);
            return;
        }

        while self.counters.current_bytes.load(Ordering::SeqCst) + size_bytes
            > self.config.budget_bytes
        {
            if !self.evict_lru() {
                break;
            }
        }

        let tick = self.next_tick();
        let entry = CacheEntry {
            table,
            size_bytes,
            data_type: flight.data_type.clone(),
            created_at: Instant::now(),
            created_tick: tick,
            last_access_tick: tick,
            ttl: self.config.ttl,
        };

        let mut invalidated = false;
        if let Some(mut slot) = self.slots.get_mut(key) {
            let still_ours = matches!(&*slot, Slot::Pending(f) if f.id == flight.id);
            // Invalidation flags the flight under this same shard lock
            invalidated = !flight.cacheable.load(Ordering::SeqCst);
            if still_ours && !invalidated {
                *slot = Slot::Ready(entry);
                self.counters
                    .current_bytes
                    .fetch_add(size_bytes, Ordering::SeqCst);
                self.counters.entries.fetch_add(1, Ordering::SeqCst);
            }
        }
        if invalidated {
            self.remove_pending(key, flight.id);
        }
    }

    /// Evict the least recently accessed ready entry (oldest creation breaks
    /// ties). Returns false when there is nothing left to evict.
    fn evict_lru(&self) -> bool {
        let candidate = self
            .slots
            .iter()
            .filter_map(|item| match item.value() {
                Slot::Ready(entry) => Some((
                    entry.last_access_tick,
                    entry.created_tick,
                    item.key().clone(),
                )),
                Slot::Pending(_) => None,
            })
            .min_by_key(|(access, created, _)| (*access, *created));

        let Some((access, _, key)) = candidate else {
            return false;
        };

        let removed = self.slots.remove_if(&key, |_, slot| {
            matches!(slot, Slot::Ready(entry) if entry.last_access_tick == access)
        });
        if let Some((_, Slot::Ready(entry))) = removed {
            self.release(entry.size_bytes);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Evicted {} ({} bytes) to stay within the cache budget",
                key.short(),
                entry.size_bytes
            );
        }
        true
    }
}

/// Completes an in-flight computation; if the task is aborted or panics
/// before finishing, waiters are released with `Cancelled`
struct FlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    flight: Arc<InFlight>,
    finished: bool,
}

impl FlightGuard {
    fn finish(&mut self, outcome: Outcome) {
        self.finished = true;
        match &outcome {
            Ok(table) if self.flight.cacheable.load(Ordering::SeqCst) => {
                self.inner.store(&self.key, &self.flight, table.clone());
            }
            _ => self.inner.remove_pending(&self.key, self.flight.id),
        }
        self.flight.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.remove_pending(&self.key, self.flight.id);
            self.flight
                .tx
                .send_replace(Some(Err(QueryError::Cancelled)));
        }
    }
}

struct WaiterGuard(Arc<InFlight>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::spec::{QuerySpec, Resolution, TimeRange};
    use chrono::{TimeZone, Utc};
    use polars::prelude::*;

    fn key(name: &str) -> CacheKey {
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(3_600, 0).unwrap();
        CacheKey::for_query(&QuerySpec::new(name, TimeRange::new(start, end)), Resolution::Fine)
    }

    fn frame(rows: usize) -> DataFrame {
        let values: Vec<f64> = (0..rows).map(|i| i as f64).collect();
        df!["rrp" => values].unwrap()
    }

    /// Cache that weighs entries by row count
    fn row_weighted(budget: u64, ttl: Duration) -> ResultCache {
        ResultCache::with_weigher(
            CacheConfig {
                budget_bytes: budget,
                ttl,
            },
            Arc::new(|df: &DataFrame| df.height() as u64),
        )
    }

    async fn insert(cache: &ResultCache, name: &str, rows: usize) {
        cache
            .get_or_compute(&key(name), move || async move { Ok(frame(rows)) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_hit() {
        let cache = ResultCache::new(CacheConfig::default());
        let first = cache
            .get_or_compute(&key("price"), || async { Ok(frame(3)) })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(&key("price"), || async {
                Err(QueryError::Storage("should not run".to_string()))
            })
            .await
            .unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert!(first.table.equals(&second.table));

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.current_bytes > 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_budget() {
        let cache = row_weighted(100, Duration::from_secs(60));
        insert(&cache, "a", 40).await;
        insert(&cache, "b", 40).await;
        insert(&cache, "c", 40).await;

        // a was least recently used
        assert_eq!(cache.stats().eviction_count, 1);
        assert!(!cache.contains(&key("a")));

        insert(&cache, "d", 30).await;

        let stats = cache.stats();
        assert_eq!(stats.eviction_count, 2);
        assert_eq!(stats.current_bytes, 70);
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
    }

    #[tokio::test]
    async fn test_access_refreshes_lru_position() {
        let cache = row_weighted(100, Duration::from_secs(60));
        insert(&cache, "a", 40).await;
        insert(&cache, "b", 40).await;

        // touching a makes b the eviction candidate
        insert(&cache, "a", 40).await;
        insert(&cache, "c", 40).await;

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[tokio::test]
    async fn test_oversized_result_is_returned_but_not_cached() {
        let cache = row_weighted(10, Duration::from_secs(60));
        insert(&cache, "small", 5).await;
        let lookup = cache
            .get_or_compute(&key("huge"), || async { Ok(frame(50)) })
            .await
            .unwrap();

        assert_eq!(lookup.table.height(), 50);
        assert!(!cache.contains(&key("huge")));
        assert!(cache.contains(&key("small")));
        assert_eq!(cache.stats().current_bytes, 5);
    }

    #[tokio::test]
    async fn test_expired_entry_is_recomputed() {
        let cache = row_weighted(100, Duration::from_millis(20));
        insert(&cache, "a", 10).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let lookup = cache
            .get_or_compute(&key("a"), || async { Ok(frame(11)) })
            .await
            .unwrap();
        assert!(!lookup.cache_hit);
        assert_eq!(lookup.table.height(), 11);
        assert_eq!(cache.stats().eviction_count, 1);
        assert_eq!(cache.stats().current_bytes, 11);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = row_weighted(100, Duration::from_millis(20));
        insert(&cache, "a", 10).await;
        insert(&cache, "b", 10).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_miss() {
        let cache = ResultCache::new(CacheConfig::default());
        insert(&cache, "a", 3).await;
        assert!(cache.invalidate(&key("a")));
        assert!(!cache.invalidate(&key("a")));

        let lookup = cache
            .get_or_compute(&key("a"), || async { Ok(frame(4)) })
            .await
            .unwrap();
        assert!(!lookup.cache_hit);
        assert_eq!(lookup.table.height(), 4);
    }

    #[tokio::test]
    async fn test_invalidate_data_type_and_clear() {
        let cache = row_weighted(1_000, Duration::from_secs(60));
        let tagged = |data_type: &str| ComputeOptions {
            data_type: Some(data_type.to_string()),
            ..Default::default()
        };
        for (name, data_type) in [("g1", "generation"), ("g2", "generation"), ("p1", "price")] {
            cache
                .get_or_compute_with(&key(name), || async { Ok(frame(10)) }, &tagged(data_type))
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate_data_type("generation"), 2);
        assert_eq!(cache.stats().entry_count, 1);
        assert!(cache.contains(&key("p1")));

        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ResultCache::new(CacheConfig::default());
        let err = cache
            .get_or_compute(&key("a"), || async {
                Err(QueryError::Storage("file not found".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Storage("file not found".to_string()));
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.stats().entry_count, 0);

        insert(&cache, "a", 2).await;
        assert!(cache.contains(&key("a")));
    }

    #[tokio::test]
    async fn test_deadline_abandons_wait_but_computation_completes() {
        let cache = ResultCache::new(CacheConfig::default());
        let options = ComputeOptions {
            deadline: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let err = cache
            .get_or_compute_with(
                &key("slow"),
                || async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(frame(7))
                },
                &options,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::DeadlineExceeded(_)));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.contains(&key("slow")));
    }

    #[tokio::test]
    async fn test_sole_owner_cancellation_aborts_computation() {
        let cache = ResultCache::new(CacheConfig::default());
        let token = CancellationToken::new();
        let options = ComputeOptions {
            cancel: Some(token.clone()),
            ..Default::default()
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = cache
            .get_or_compute_with(
                &key("slow"),
                || async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(frame(7))
                },
                &options,
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Cancelled);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!cache.contains(&key("slow")));

        // The slot is free again
        insert(&cache, "slow", 1).await;
        assert!(cache.contains(&key("slow")));
    }

    /// Start a 60ms computation of `rows` rows for `name` on its own task
    fn spawn_slow(
        cache: &ResultCache,
        name: &'static str,
        rows: usize,
        options: ComputeOptions,
    ) -> tokio::task::JoinHandle<Result<CacheLookup>> {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute_with(
                    &key(name),
                    move || async move {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(frame(rows))
                    },
                    &options,
                )
                .await
        })
    }

    #[tokio::test]
    async fn test_owner_cancellation_spares_other_waiters() {
        let cache = ResultCache::new(CacheConfig::default());
        let token = CancellationToken::new();
        let owner = spawn_slow(
            &cache,
            "shared",
            3,
            ComputeOptions {
                cancel: Some(token.clone()),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = spawn_slow(&cache, "shared", 99, ComputeOptions::default());
        tokio::time::sleep(Duration::from_millis(5)).await;

        token.cancel();

        assert_eq!(owner.await.unwrap().unwrap_err(), QueryError::Cancelled);
        let lookup = waiter.await.unwrap().unwrap();
        assert_eq!(lookup.table.height(), 3);
        assert!(!lookup.cache_hit);
        assert!(cache.contains(&key("shared")));
        assert_eq!(cache.stats().coalesced_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_slot_is_free_for_the_next_caller() {
        let cache = ResultCache::new(CacheConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let err = cache
            .get_or_compute_with(
                &key("slow"),
                || async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(frame(7))
                },
                &ComputeOptions {
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Cancelled);

        // No time for the aborted task to wind down: a new caller must not
        // attach to it
        let lookup = cache
            .get_or_compute(&key("slow"), || async { Ok(frame(2)) })
            .await
            .unwrap();
        assert_eq!(lookup.table.height(), 2);
        assert_eq!(cache.stats().coalesced_count, 0);
    }

    #[tokio::test]
    async fn test_waiter_deadline_leaves_owner_untouched() {
        let cache = ResultCache::new(CacheConfig::default());
        let owner = spawn_slow(&cache, "slow", 4, ComputeOptions::default());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = cache
            .get_or_compute_with(
                &key("slow"),
                || async { Ok(frame(1)) },
                &ComputeOptions {
                    deadline: Some(Duration::from_millis(10)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::DeadlineExceeded(_)));

        let lookup = owner.await.unwrap().unwrap();
        assert_eq!(lookup.table.height(), 4);
        assert!(cache.contains(&key("slow")));
    }

    #[tokio::test]
    async fn test_invalidate_during_computation_delivers_without_caching() {
        let cache = ResultCache::new(CacheConfig::default());
        let owner = spawn_slow(&cache, "slow", 4, ComputeOptions::default());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!cache.invalidate(&key("slow")));

        let lookup = owner.await.unwrap().unwrap();
        assert_eq!(lookup.table.height(), 4);
        assert!(!cache.contains(&key("slow")));
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_clear_during_computation_delivers_without_caching() {
        let cache = ResultCache::new(CacheConfig::default());
        let owner = spawn_slow(&cache, "slow", 4, ComputeOptions::default());
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.clear();

        let lookup = owner.await.unwrap().unwrap();
        assert_eq!(lookup.table.height(), 4);
        assert!(!cache.contains(&key("slow")));
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[test]
    fn test_store_rechecks_invalidation_under_the_slot_lock() {
        let cache = ResultCache::new(CacheConfig::default());
        let Role::Owner(flight) = cache.acquire(&key("a"), None) else {
            panic!("first lookup should own the computation");
        };

        // Invalidated after the completing task looked at the flag
        flight.cacheable.store(false, Ordering::SeqCst);
        cache.inner.store(&key("a"), &flight, Arc::new(frame(2)));

        assert!(!cache.contains(&key("a")));
        assert!(cache.inner.slots.get(&key("a")).is_none());
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }
}

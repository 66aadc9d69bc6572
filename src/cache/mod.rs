//! Result caching for the query layer

pub mod result_cache;

pub use result_cache::{
    CacheConfig, CacheLookup, CacheStats, ComputeOptions, ResultCache, Table, Weigher,
};

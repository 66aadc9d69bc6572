//! Query Module
//!
//! Query specifications, cache keys, and the manager that serves queries.

pub mod cache_key;
pub mod manager;
pub mod spec;

pub use cache_key::CacheKey;
pub use manager::{HybridQueryManager, QueryMetadata, QueryOptions, QueryResponse};
pub use spec::{
    AggFn, Aggregation, FilterValue, QuerySpec, RequestedResolution, Resolution, TimeRange,
};

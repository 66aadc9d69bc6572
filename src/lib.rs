pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod query;
pub mod resolution;

// Re-export the types most callers need
pub use cache::{CacheStats, ResultCache};
pub use config::HybridQueryConfig;
pub use error::{QueryError, Result};
pub use execution::{ParquetStore, StorageEngine};
pub use query::{
    HybridQueryManager, QueryMetadata, QueryOptions, QueryResponse, QuerySpec,
    RequestedResolution, Resolution, TimeRange,
};

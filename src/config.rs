//! Configuration
//!
//! Tunables of the hybrid query layer. Read once at startup (defaults, then a
//! JSON file and/or `GRID_QUERY_*` environment variables) and handed to
//! [`HybridQueryManager`](crate::query::manager::HybridQueryManager) by value.

use crate::cache::CacheConfig;
use crate::error::{QueryError, Result};
use crate::resolution::estimator::DataTypeProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CACHE_BUDGET_BYTES: &str = "GRID_QUERY_CACHE_BUDGET_BYTES";
pub const ENV_CACHE_TTL_SECS: &str = "GRID_QUERY_CACHE_TTL_SECS";
pub const ENV_FINE_THRESHOLD_BYTES: &str = "GRID_QUERY_FINE_THRESHOLD_BYTES";
pub const ENV_CHUNKING_THRESHOLD_BYTES: &str = "GRID_QUERY_CHUNKING_THRESHOLD_BYTES";
pub const ENV_CHUNK_ROW_TARGET: &str = "GRID_QUERY_CHUNK_ROW_TARGET";
pub const ENV_DATA_DIR: &str = "GRID_QUERY_DATA_DIR";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridQueryConfig {
    /// Total bytes the result cache may hold
    pub cache_budget_bytes: u64,

    /// Lifetime of a cached result; matches the 5-minute ingestion cadence
    pub cache_ttl_secs: u64,

    /// Estimated fine-resolution size at or above which `auto` picks coarse
    pub fine_threshold_bytes: u64,

    /// Estimated result size above which execution is chunked
    pub chunking_threshold_bytes: u64,

    /// Rows per chunk on the chunked path
    pub chunk_row_target: usize,

    /// Root of the parquet store
    pub data_dir: PathBuf,

    /// Size profiles per dataset
    pub data_types: HashMap<String, DataTypeProfile>,
}

impl Default for HybridQueryConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 256 * MIB,
            cache_ttl_secs: 300,
            fine_threshold_bytes: 64 * MIB,
            chunking_threshold_bytes: 32 * MIB,
            chunk_row_target: 100_000,
            data_dir: PathBuf::from("data"),
            data_types: DataTypeProfile::builtin(),
        }
    }
}

impl HybridQueryConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QueryError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            QueryError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `GRID_QUERY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `GRID_QUERY_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_CACHE_BUDGET_BYTES)? {
            self.cache_budget_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CACHE_TTL_SECS)? {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_FINE_THRESHOLD_BYTES)? {
            self.fine_threshold_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CHUNKING_THRESHOLD_BYTES)? {
            self.chunking_threshold_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CHUNK_ROW_TARGET)? {
            self.chunk_row_target = v;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_budget_bytes == 0 {
            return Err(QueryError::Config("cache_budget_bytes must be > 0".to_string()));
        }
        if self.cache_ttl_secs == 0 {
            return Err(QueryError::Config("cache_ttl_secs must be > 0".to_string()));
        }
        if self.chunk_row_target == 0 {
            return Err(QueryError::Config("chunk_row_target must be > 0".to_string()));
        }
        if let Some((name, _)) = self
            .data_types
            .iter()
            .find(|(_, profile)| profile.series_per_interval == 0)
        {
            return Err(QueryError::Config(format!(
                "data type '{}' must have series_per_interval > 0",
                name
            )));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            budget_bytes: self.cache_budget_bytes,
            ttl: self.cache_ttl(),
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| QueryError::Config(format!("{}='{}': {}", name, raw, e))),
    }
}

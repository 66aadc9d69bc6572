use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the hybrid query layer.
///
/// `Clone` because a single in-flight computation hands the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid query spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid time range: end {end} is before start {start}")]
    InvalidRange { start: String, end: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Deadline of {0:?} exceeded while waiting for query result")]
    DeadlineExceeded(Duration),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<polars::prelude::PolarsError> for QueryError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        QueryError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for QueryError {
    fn from(e: std::io::Error) -> Self {
        QueryError::Storage(format!("IO error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

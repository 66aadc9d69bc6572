//! Cache Keys
//!
//! Canonical, order-independent signature of a resolved query.

use crate::query::spec::{QuerySpec, Resolution};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest (hex) of a query's canonical form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `spec` read at `resolution`.
    ///
    /// The time range is rounded to the resolution's native interval, the
    /// projection is sorted and filter values are already held in sorted sets,
    /// so structurally equal requests always land on the same key.
    pub fn for_query(spec: &QuerySpec, resolution: Resolution) -> Self {
        let canonical = canonical_form(spec, resolution);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn canonical_form(spec: &QuerySpec, resolution: Resolution) -> String {
    let range = spec.time_range().rounded_to(resolution);

    // Names are written quoted and escaped so separators inside a name cannot
    // alias a different structure
    let columns = spec.columns().iter().sorted().map(quoted).join(",");

    let filters = spec
        .filters()
        .iter()
        .map(|(column, values)| format!("{}=[{}]", quoted(column), values.iter().join(",")))
        .join(";");

    let aggregation = match spec.aggregation() {
        Some(agg) => format!(
            "by=[{}];aggs=[{}]",
            agg.group_by.iter().map(quoted).join(","),
            agg.aggregates
                .iter()
                .map(|(column, func)| format!("{}:{}", quoted(column), func.as_str()))
                .join(",")
        ),
        None => "none".to_string(),
    };

    format!(
        "v2|type={}|res={}|start={}|end={}|cols=[{}]|filters=[{}]|agg={}",
        quoted(spec.data_type()),
        resolution,
        range.start().timestamp(),
        range.end().timestamp(),
        columns,
        filters,
        aggregation
    )
}

fn quoted(name: impl AsRef<str>) -> String {
    format!("{:?}", name.as_ref())
}

//! Query Specification
//!
//! Immutable description of a read against the market telemetry store:
//! dataset, half-open time range, sampling resolution, projection,
//! value-set filters and an optional aggregation.

use crate::error::{QueryError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

/// Native sampling interval of the fine (dispatch) dataset.
pub const FINE_INTERVAL_SECS: i64 = 5 * 60;

/// Native sampling interval of the coarse (trading) dataset.
pub const COARSE_INTERVAL_SECS: i64 = 30 * 60;

/// A concrete sampling resolution that exists in storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 5-minute samples
    Fine,
    /// 30-minute pre-aggregated samples
    Coarse,
}

impl Resolution {
    pub fn native_interval_secs(&self) -> i64 {
        match self {
            Resolution::Fine => FINE_INTERVAL_SECS,
            Resolution::Coarse => COARSE_INTERVAL_SECS,
        }
    }

    /// Directory name of this resolution inside the data directory
    pub fn dir_name(&self) -> &'static str {
        match self {
            Resolution::Fine => "5min",
            Resolution::Coarse => "30min",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Fine => "fine",
            Resolution::Coarse => "coarse",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution as requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedResolution {
    Fine,
    Coarse,
    /// Let the resolution selector decide
    #[default]
    Auto,
}

impl RequestedResolution {
    /// The caller-forced resolution, or `None` for `Auto`
    pub fn forced(&self) -> Option<Resolution> {
        match self {
            RequestedResolution::Fine => Some(Resolution::Fine),
            RequestedResolution::Coarse => Some(Resolution::Coarse),
            RequestedResolution::Auto => None,
        }
    }
}

impl From<Resolution> for RequestedResolution {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Fine => RequestedResolution::Fine,
            Resolution::Coarse => RequestedResolution::Coarse,
        }
    }
}

impl FromStr for RequestedResolution {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fine" | "5min" | "5m" => Ok(RequestedResolution::Fine),
            "coarse" | "30min" | "30m" => Ok(RequestedResolution::Coarse),
            "auto" => Ok(RequestedResolution::Auto),
            other => Err(QueryError::InvalidSpec(format!(
                "unknown resolution '{}' (expected fine, coarse or auto)",
                other
            ))),
        }
    }
}

impl fmt::Display for RequestedResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedResolution::Fine => f.write_str("fine"),
            RequestedResolution::Coarse => f.write_str("coarse"),
            RequestedResolution::Auto => f.write_str("auto"),
        }
    }
}

/// Half-open `[start, end)` time range
///
/// Construction does not reject inverted ranges; they are caught by
/// [`QuerySpec::validate`] and by the resolution selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn is_inverted(&self) -> bool {
        self.end < self.start
    }

    /// Span in seconds; negative for an inverted range
    pub fn span_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    pub fn span_hours(&self) -> f64 {
        self.span_seconds() as f64 / 3600.0
    }

    /// Widen the range to whole intervals of `resolution`: start is floored,
    /// end is ceiled, both against the Unix epoch.
    pub fn rounded_to(&self, resolution: Resolution) -> TimeRange {
        let interval = resolution.native_interval_secs();
        let start = self.start.timestamp().div_euclid(interval) * interval;
        let end_secs = self.end.timestamp();
        let end = if end_secs.rem_euclid(interval) == 0 && self.end.timestamp_subsec_nanos() == 0 {
            end_secs
        } else {
            (end_secs.div_euclid(interval) + 1) * interval
        };
        TimeRange {
            start: epoch_to_utc(start),
            end: epoch_to_utc(end.max(start)),
        }
    }
}

fn epoch_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A single allowed value in a filter set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Bool(b) => write!(f, "b:{}", b),
            FilterValue::Int(i) => write!(f, "i:{}", i),
            FilterValue::Str(s) => write!(f, "s:{:?}", s),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Str(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Str(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

/// Aggregate function applied per column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Sum,
    Mean,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl AggFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFn::Sum => "sum",
            AggFn::Mean => "mean",
            AggFn::Min => "min",
            AggFn::Max => "max",
            AggFn::Count => "count",
            AggFn::First => "first",
            AggFn::Last => "last",
        }
    }
}

/// Optional group-by columns plus one aggregate per value column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub group_by: Vec<String>,
    pub aggregates: BTreeMap<String, AggFn>,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate(mut self, column: impl Into<String>, func: AggFn) -> Self {
        self.aggregates.insert(column.into(), func);
        self
    }
}

/// A requested read
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    data_type: String,
    time_range: TimeRange,
    #[serde(default)]
    resolution: RequestedResolution,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    filters: BTreeMap<String, BTreeSet<FilterValue>>,
    #[serde(default)]
    aggregation: Option<Aggregation>,
}

impl QuerySpec {
    /// Create a spec for `data_type` over `time_range` with `auto` resolution
    pub fn new(data_type: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            data_type: data_type.into(),
            time_range,
            resolution: RequestedResolution::Auto,
            columns: Vec::new(),
            filters: BTreeMap::new(),
            aggregation: None,
        }
    }

    pub fn with_resolution(mut self, resolution: RequestedResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the projection. Repeated names keep their first position.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        self.columns = columns
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| seen.insert(c.clone()))
            .collect();
        self
    }

    /// Restrict `column` to a set of allowed values. Calling this twice for the
    /// same column replaces the earlier set.
    pub fn with_filter<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        self.filters
            .insert(column.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn time_range(&self) -> &TimeRange {
        &self.time_range
    }

    pub fn resolution(&self) -> RequestedResolution {
        self.resolution
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn filters(&self) -> &BTreeMap<String, BTreeSet<FilterValue>> {
        &self.filters
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.aggregation.as_ref()
    }

    /// Check the spec for caller errors
    pub fn validate(&self) -> Result<()> {
        if self.data_type.trim().is_empty() {
            return Err(QueryError::InvalidSpec("data type must not be empty".to_string()));
        }

        if self.time_range.is_inverted() {
            return Err(QueryError::InvalidSpec(format!(
                "time range is inverted: end {} is before start {}",
                self.time_range.end.to_rfc3339(),
                self.time_range.start.to_rfc3339()
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.trim().is_empty() {
                return Err(QueryError::InvalidSpec(
                    "projection contains an empty column name".to_string(),
                ));
            }
            if !seen.insert(column.as_str()) {
                return Err(QueryError::InvalidSpec(format!(
                    "column '{}' appears more than once in the projection",
                    column
                )));
            }
        }

        for (column, values) in &self.filters {
            if column.trim().is_empty() {
                return Err(QueryError::InvalidSpec(
                    "filter on an empty column name".to_string(),
                ));
            }
            if values.is_empty() {
                return Err(QueryError::InvalidSpec(format!(
                    "filter on '{}' has no allowed values",
                    column
                )));
            }
        }

        if let Some(aggregation) = &self.aggregation {
            self.validate_aggregation(aggregation)?;
        }

        Ok(())
    }

    fn validate_aggregation(&self, aggregation: &Aggregation) -> Result<()> {
        if aggregation.aggregates.is_empty() {
            return Err(QueryError::InvalidSpec(
                "aggregation requires at least one aggregate column".to_string(),
            ));
        }

        for column in aggregation.group_by.iter().chain(aggregation.aggregates.keys()) {
            if column.trim().is_empty() {
                return Err(QueryError::InvalidSpec(
                    "aggregation references an empty column name".to_string(),
                ));
            }
            if !self.columns.is_empty() && !self.columns.contains(column) {
                return Err(QueryError::InvalidSpec(format!(
                    "aggregation column '{}' is not part of the projection",
                    column
                )));
            }
        }

        if let Some(column) = aggregation
            .group_by
            .iter()
            .find(|c| aggregation.aggregates.contains_key(*c))
        {
            return Err(QueryError::InvalidSpec(format!(
                "column '{}' is both a group-by key and an aggregate",
                column
            )));
        }

        Ok(())
    }

    /// Copy of this spec pinned to a concrete resolution, with the time range
    /// widened to whole intervals of that resolution.
    pub(crate) fn normalized_for(&self, resolution: Resolution) -> QuerySpec {
        let mut spec = self.clone();
        spec.resolution = resolution.into();
        spec.time_range = self.time_range.rounded_to(resolution);
        spec
    }
}

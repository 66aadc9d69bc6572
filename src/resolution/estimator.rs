//! Memory Estimator
//!
//! Predicts the in-memory footprint of a query result from static per-dataset
//! size coefficients. Pure arithmetic: never touches storage.

use crate::query::spec::{Resolution, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Extra bytes charged once per row when any projected column is variable width
pub const VARIABLE_WIDTH_ROW_OVERHEAD: u64 = 16;

/// Width assumed for a projected column the profile does not know about
pub const UNKNOWN_COLUMN_WIDTH: u64 = 8;

/// Row width assumed for an unknown dataset read without a projection
pub const FALLBACK_ROW_WIDTH: u64 = 64;

/// Storage type of a column, as far as size estimation is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Int64,
    Float64,
    Timestamp,
    Bool,
    /// Strings, counted at a fixed average width
    Utf8 { avg_width: u32 },
}

impl ColumnKind {
    pub fn width(&self) -> u64 {
        match self {
            ColumnKind::Int64 | ColumnKind::Float64 | ColumnKind::Timestamp => 8,
            ColumnKind::Bool => 1,
            ColumnKind::Utf8 { avg_width } => *avg_width as u64,
        }
    }

    pub fn is_variable_width(&self) -> bool {
        matches!(self, ColumnKind::Utf8 { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnKind,
}

impl ColumnProfile {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Size coefficients of one dataset (generation, price, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeProfile {
    /// Int64 epoch-seconds column used for time-range filtering
    #[serde(default = "default_time_column")]
    pub time_column: String,

    /// All columns of the dataset, in storage order
    #[serde(default)]
    pub columns: Vec<ColumnProfile>,

    /// Rows produced per sample interval (one per unit, region, link, ...)
    #[serde(default = "default_series_per_interval")]
    pub series_per_interval: u32,
}

fn default_time_column() -> String {
    "timestamp".to_string()
}

fn default_series_per_interval() -> u32 {
    1
}

impl DataTypeProfile {
    pub fn new(columns: Vec<ColumnProfile>, series_per_interval: u32) -> Self {
        Self {
            time_column: default_time_column(),
            columns,
            series_per_interval,
        }
    }

    /// Unit-level generator output (SCADA readings)
    pub fn generation() -> Self {
        Self::new(
            vec![
                ColumnProfile::new("timestamp", ColumnKind::Timestamp),
                ColumnProfile::new("duid", ColumnKind::Utf8 { avg_width: 8 }),
                ColumnProfile::new("scada_value", ColumnKind::Float64),
            ],
            500,
        )
    }

    /// Regional reference prices
    pub fn price() -> Self {
        Self::new(
            vec![
                ColumnProfile::new("timestamp", ColumnKind::Timestamp),
                ColumnProfile::new("region_id", ColumnKind::Utf8 { avg_width: 4 }),
                ColumnProfile::new("rrp", ColumnKind::Float64),
            ],
            5,
        )
    }

    /// Transmission interconnector flows and limits
    pub fn interconnector() -> Self {
        Self::new(
            vec![
                ColumnProfile::new("timestamp", ColumnKind::Timestamp),
                ColumnProfile::new("interconnector_id", ColumnKind::Utf8 { avg_width: 10 }),
                ColumnProfile::new("mw_flow", ColumnKind::Float64),
                ColumnProfile::new("export_limit", ColumnKind::Float64),
                ColumnProfile::new("import_limit", ColumnKind::Float64),
            ],
            6,
        )
    }

    /// Regional demand
    pub fn demand() -> Self {
        Self::new(
            vec![
                ColumnProfile::new("timestamp", ColumnKind::Timestamp),
                ColumnProfile::new("region_id", ColumnKind::Utf8 { avg_width: 4 }),
                ColumnProfile::new("total_demand", ColumnKind::Float64),
                ColumnProfile::new("available_generation", ColumnKind::Float64),
            ],
            5,
        )
    }

    /// Profiles shipped with the crate, keyed by data-type tag
    pub fn builtin() -> HashMap<String, DataTypeProfile> {
        HashMap::from([
            ("generation".to_string(), Self::generation()),
            ("price".to_string(), Self::price()),
            ("interconnector".to_string(), Self::interconnector()),
            ("demand".to_string(), Self::demand()),
        ])
    }

    fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Estimated bytes per row for a projection (empty = every column)
    pub fn bytes_per_row(&self, projection: &[String]) -> u64 {
        if projection.is_empty() {
            if self.columns.is_empty() {
                return FALLBACK_ROW_WIDTH;
            }
            let widths: u64 = self.columns.iter().map(|c| c.kind.width()).sum();
            let variable = self.columns.iter().any(|c| c.kind.is_variable_width());
            return widths + if variable { VARIABLE_WIDTH_ROW_OVERHEAD } else { 0 };
        }

        let mut widths = 0;
        let mut variable = false;
        for name in projection {
            match self.column(name) {
                Some(column) => {
                    widths += column.kind.width();
                    variable |= column.kind.is_variable_width();
                }
                None => widths += UNKNOWN_COLUMN_WIDTH,
            }
        }
        widths + if variable { VARIABLE_WIDTH_ROW_OVERHEAD } else { 0 }
    }
}

/// Result-size estimator over a table of dataset profiles
#[derive(Debug, Clone)]
pub struct MemoryEstimator {
    profiles: HashMap<String, DataTypeProfile>,
    fallback: DataTypeProfile,
}

impl MemoryEstimator {
    pub fn new(profiles: HashMap<String, DataTypeProfile>) -> Self {
        Self {
            profiles,
            fallback: DataTypeProfile::new(Vec::new(), 1),
        }
    }

    pub fn with_builtin_profiles() -> Self {
        Self::new(DataTypeProfile::builtin())
    }

    /// Profile for `data_type`, or the generic fallback
    pub fn profile(&self, data_type: &str) -> &DataTypeProfile {
        self.profiles.get(data_type).unwrap_or(&self.fallback)
    }

    pub fn knows(&self, data_type: &str) -> bool {
        self.profiles.contains_key(data_type)
    }

    /// Expected row count; 0 for an empty or inverted range
    pub fn estimate_rows(&self, range: &TimeRange, resolution: Resolution, data_type: &str) -> u64 {
        let span = range.span_seconds();
        if span <= 0 {
            return 0;
        }
        let intervals = span as u64 / resolution.native_interval_secs() as u64;
        intervals.saturating_mul(self.profile(data_type).series_per_interval as u64)
    }

    /// Expected result size in bytes; 0 for an empty or inverted range
    pub fn estimate(
        &self,
        range: &TimeRange,
        resolution: Resolution,
        data_type: &str,
        columns: &[String],
    ) -> u64 {
        self.estimate_rows(range, resolution, data_type)
            .saturating_mul(self.profile(data_type).bytes_per_row(columns))
    }
}

impl Default for MemoryEstimator {
    fn default() -> Self {
        Self::with_builtin_profiles()
    }
}

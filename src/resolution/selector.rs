//! Resolution Selector
//!
//! Picks the fine or coarse dataset for `auto` requests by comparing the
//! estimated fine-resolution footprint against a byte threshold.

use crate::error::{QueryError, Result};
use crate::query::spec::{RequestedResolution, Resolution, TimeRange};
use crate::resolution::estimator::MemoryEstimator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Why a resolution was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Fine estimate reached the threshold, fell back to coarse
    SpanExceedsFineThreshold,
    /// Fine estimate stayed under the threshold
    WithinFineThreshold,
    /// Caller asked for a specific resolution
    CallerForced,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::SpanExceedsFineThreshold => "span_exceeds_fine_threshold",
            ReasonCode::WithinFineThreshold => "within_fine_threshold",
            ReasonCode::CallerForced => "caller_forced",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolution selection. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    pub resolution: Resolution,
    pub estimated_bytes: u64,
    pub reason: ReasonCode,
}

pub struct ResolutionSelector {
    estimator: Arc<MemoryEstimator>,
    fine_threshold_bytes: u64,
}

impl ResolutionSelector {
    pub fn new(estimator: Arc<MemoryEstimator>, fine_threshold_bytes: u64) -> Self {
        Self {
            estimator,
            fine_threshold_bytes,
        }
    }

    pub fn fine_threshold_bytes(&self) -> u64 {
        self.fine_threshold_bytes
    }

    /// Choose a resolution for an `auto` request.
    ///
    /// Estimates exactly at the threshold resolve to coarse.
    pub fn select(&self, range: &TimeRange, data_type: &str) -> Result<ResolutionDecision> {
        if range.is_inverted() {
            return Err(QueryError::InvalidRange {
                start: range.start().to_rfc3339(),
                end: range.end().to_rfc3339(),
            });
        }

        let fine_bytes = self.estimator.estimate(range, Resolution::Fine, data_type, &[]);

        let decision = if fine_bytes >= self.fine_threshold_bytes {
            ResolutionDecision {
                resolution: Resolution::Coarse,
                estimated_bytes: self
                    .estimator
                    .estimate(range, Resolution::Coarse, data_type, &[]),
                reason: ReasonCode::SpanExceedsFineThreshold,
            }
        } else {
            ResolutionDecision {
                resolution: Resolution::Fine,
                estimated_bytes: fine_bytes,
                reason: ReasonCode::WithinFineThreshold,
            }
        };

        debug!(
            "Resolution for {} over {:.1}h: {} ({}, fine estimate {} bytes, threshold {})",
            data_type,
            range.span_hours(),
            decision.resolution,
            decision.reason,
            fine_bytes,
            self.fine_threshold_bytes
        );

        Ok(decision)
    }

    /// Resolve a caller's request: forced resolutions are echoed back without
    /// any threshold check, `auto` goes through [`select`](Self::select).
    pub fn decide(
        &self,
        requested: RequestedResolution,
        range: &TimeRange,
        data_type: &str,
        columns: &[String],
    ) -> Result<ResolutionDecision> {
        match requested.forced() {
            Some(resolution) => Ok(ResolutionDecision {
                resolution,
                estimated_bytes: self.estimator.estimate(range, resolution, data_type, columns),
                reason: ReasonCode::CallerForced,
            }),
            None => {
                let mut decision = self.select(range, data_type)?;
                if !columns.is_empty() {
                    decision.estimated_bytes =
                        self.estimator
                            .estimate(range, decision.resolution, data_type, columns);
                }
                Ok(decision)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn selector(threshold: u64) -> ResolutionSelector {
        ResolutionSelector::new(Arc::new(MemoryEstimator::with_builtin_profiles()), threshold)
    }

    fn days(n: i64) -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        TimeRange::new(start, start + Duration::days(n))
    }

    #[test]
    fn test_long_span_falls_back_to_coarse() {
        let decision = selector(64 * 1024 * 1024).select(&days(45), "generation").unwrap();
        assert_eq!(decision.resolution, Resolution::Coarse);
        assert_eq!(decision.reason, ReasonCode::SpanExceedsFineThreshold);
    }

    #[test]
    fn test_short_span_stays_fine() {
        let decision = selector(64 * 1024 * 1024).select(&days(2), "generation").unwrap();
        assert_eq!(decision.resolution, Resolution::Fine);
        assert_eq!(decision.reason, ReasonCode::WithinFineThreshold);
        assert_eq!(decision.estimated_bytes, 2 * 288 * 500 * 40);
    }

    #[test]
    fn test_estimate_at_threshold_resolves_to_coarse() {
        let exact = 288 * 500 * 40;
        let decision = selector(exact).select(&days(1), "generation").unwrap();
        assert_eq!(decision.resolution, Resolution::Coarse);

        let decision = selector(exact + 1).select(&days(1), "generation").unwrap();
        assert_eq!(decision.resolution, Resolution::Fine);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start - Duration::seconds(1));
        assert!(matches!(
            selector(1).select(&range, "price"),
            Err(QueryError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_forced_resolution_skips_threshold() {
        let decision = selector(1)
            .decide(RequestedResolution::Fine, &days(90), "generation", &[])
            .unwrap();
        assert_eq!(decision.resolution, Resolution::Fine);
        assert_eq!(decision.reason, ReasonCode::CallerForced);
    }
}

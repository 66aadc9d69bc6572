//! Resolution Selection
//!
//! Size estimation and fine/coarse selection for market telemetry queries.

pub mod estimator;
pub mod selector;

pub use estimator::{ColumnKind, ColumnProfile, DataTypeProfile, MemoryEstimator};
pub use selector::{ReasonCode, ResolutionDecision, ResolutionSelector};

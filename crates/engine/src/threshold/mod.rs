//! Pass/fail thresholds over aggregated metrics
//!
//! A threshold pairs a metric name with an expression such as `p(90) < 50` or
//! `rate < 0.0001`. The evaluator runs periodically against aggregator
//! snapshots; thresholds marked `abort_on_breach` end the run early.

mod evaluator;
mod expression;

pub(crate) use evaluator::evaluation_loop;
pub use evaluator::{
    AbortTrigger, EvaluationCycle, Threshold, ThresholdConfig, ThresholdEvaluator,
    ThresholdResult, ThresholdState,
};
pub use expression::{Comparison, Statistic, ThresholdExpr, ThresholdParseError};

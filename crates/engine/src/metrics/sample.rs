//! Sample and outcome types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whole-iteration latency in milliseconds, recorded by every executor
pub const ITERATION_DURATION: &str = "iteration_duration";

/// Pass/fail results of [`Reporter::check`](crate::vu::Reporter::check)
pub const CHECKS: &str = "checks";

/// Tag naming why a failed sample failed (`timeout`, `panic` or a workload error kind)
pub const ERROR_TAG: &str = "error";

/// Metrics the engine itself produces; always resolvable by thresholds
pub const RESERVED_METRICS: &[&str] = &[ITERATION_DURATION, CHECKS];

/// Free-form labels attached to a sample
pub type Tags = BTreeMap<String, String>;

/// Result of a measured operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Map a boolean success flag onto an outcome
    pub fn from_success(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn is_failure(self) -> bool {
        self == Self::Failure
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// One reported measurement
///
/// Samples are immutable once built; the builder methods consume and return
/// a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    timestamp: DateTime<Utc>,
    metric: String,
    value: f64,
    outcome: Outcome,
    tags: Tags,
}

impl Sample {
    /// Create a sample stamped with the current wall-clock time
    pub fn new(metric: impl Into<String>, value: f64, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            metric: metric.into(),
            value,
            outcome,
            tags: Tags::new(),
        }
    }

    /// Add a single tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Merge a set of tags (later keys win)
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}

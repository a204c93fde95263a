//! Per-metric accumulation

use std::collections::BTreeMap;

use hdrhistogram::errors::{AdditionError, CreationError, RecordError};
use hdrhistogram::Histogram;

use super::Outcome;

/// Distinct error kinds tracked per series; the rest share one bucket
const MAX_ERROR_KINDS: usize = 64;
const OTHER_ERRORS: &str = "other";

/// Accumulator for a single metric name inside one shard
#[derive(Debug, Clone)]
pub(crate) struct MetricSeries {
    count: u64,
    failure_count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// Failures by `error` tag
    errors: BTreeMap<String, u64>,
    histogram: Histogram<u64>,
}

impl MetricSeries {
    pub(crate) fn new(significant_figures: u8) -> Result<Self, CreationError> {
        Ok(Self {
            count: 0,
            failure_count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            errors: BTreeMap::new(),
            histogram: Histogram::new(significant_figures)?,
        })
    }

    /// Record one value; counters only move if the histogram accepted it
    ///
    /// `error` is only counted for failures.
    pub(crate) fn record(
        &mut self,
        value: f64,
        scaled: u64,
        outcome: Outcome,
        error: Option<&str>,
    ) -> Result<(), RecordError> {
        self.histogram.record(scaled)?;

        self.count += 1;
        if outcome.is_failure() {
            self.failure_count += 1;
            if let Some(kind) = error {
                self.count_error(kind, 1);
            }
        }
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        Ok(())
    }

    /// Fold another shard's series into this one
    pub(crate) fn merge(&mut self, other: &MetricSeries) -> Result<(), AdditionError> {
        self.count += other.count;
        self.failure_count += other.failure_count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (kind, count) in &other.errors {
            self.count_error(kind, *count);
        }
        self.histogram.add(&other.histogram)
    }

    fn count_error(&mut self, kind: &str, count: u64) {
        let key = if self.errors.contains_key(kind) || self.errors.len() < MAX_ERROR_KINDS {
            kind
        } else {
            OTHER_ERRORS
        };
        *self.errors.entry(key.to_string()).or_insert(0) += count;
    }

    pub(crate) fn snapshot(&self, value_scale: f64) -> SeriesSnapshot {
        SeriesSnapshot {
            count: self.count,
            failure_count: self.failure_count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            errors: self.errors.clone(),
            histogram: self.histogram.clone(),
            value_scale,
        }
    }
}

/// Point-in-time statistics for one metric
///
/// Only produced for series holding at least one sample.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    /// Number of accepted samples
    pub count: u64,
    /// Samples reported with [`Outcome::Failure`]
    pub failure_count: u64,
    /// Sum of raw values
    pub sum: f64,
    /// Smallest raw value
    pub min: f64,
    /// Largest raw value
    pub max: f64,
    /// Failures by `error` tag; untagged failures are not listed
    pub errors: BTreeMap<String, u64>,
    histogram: Histogram<u64>,
    value_scale: f64,
}

impl SeriesSnapshot {
    /// `failure_count / count`
    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.count as f64
    }

    pub fn success_count(&self) -> u64 {
        self.count - self.failure_count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Approximate percentile, `p` in `0.0..=100.0`
    ///
    /// Clamped to the observed `[min, max]`, so a single-valued series reports
    /// that value exactly.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(quantile) as f64 / self.value_scale;
        raw.clamp(self.min, self.max)
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}

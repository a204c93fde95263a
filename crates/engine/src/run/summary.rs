//! End-of-run summary

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Verdict;
use crate::metrics::{AggregateSnapshot, SeriesSnapshot};
use crate::serde_helpers::duration_millis;
use crate::threshold::{Statistic, Threshold, ThresholdResult, ThresholdState};

/// Exit status of a run that passed
pub const EXIT_PASSED: i32 = 0;

/// Exit status of a run with a breached threshold
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;

/// Why the run stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionReason {
    /// The ramp profile ran to the end
    DurationElapsed,
    /// An `abort_on_breach` threshold was breached
    ThresholdAbort {
        metric: String,
        expression: String,
        observed: f64,
    },
    /// `AbortHandle::abort` was called
    OperatorAbort,
}

impl CompletionReason {
    pub fn is_abort(&self) -> bool {
        !matches!(self, Self::DurationElapsed)
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationElapsed => write!(f, "duration elapsed"),
            Self::ThresholdAbort {
                metric,
                expression,
                observed,
            } => write!(
                f,
                "aborted by threshold '{}' on {} (observed {:.4})",
                expression, metric, observed
            ),
            Self::OperatorAbort => write!(f, "aborted by operator"),
        }
    }
}

/// Final statistics for one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub failure_count: u64,
    pub failure_rate: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    /// Percentiles referenced by thresholds, keyed like `p(99.9)`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub percentiles: BTreeMap<String, f64>,
    /// Failures by `error` tag
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, u64>,
}

impl MetricSummary {
    pub fn from_series(series: &SeriesSnapshot, extra_percentiles: &[f64]) -> Self {
        let percentiles = extra_percentiles
            .iter()
            .map(|p| (Statistic::Percentile(*p).to_string(), series.percentile(*p)))
            .collect();

        Self {
            count: series.count,
            failure_count: series.failure_count,
            failure_rate: series.failure_rate(),
            min: series.min,
            max: series.max,
            mean: series.mean(),
            p50: series.percentile(50.0),
            p90: series.percentile(90.0),
            p95: series.percentile(95.0),
            p99: series.percentile(99.0),
            percentiles,
            errors: series.errors.clone(),
        }
    }
}

/// Per-metric summaries, adding any percentile a threshold asks for
pub(crate) fn summarize_metrics(
    snapshot: &AggregateSnapshot,
    thresholds: &[Threshold],
) -> BTreeMap<String, MetricSummary> {
    snapshot
        .iter()
        .map(|(name, series)| {
            let extra: Vec<f64> = thresholds
                .iter()
                .filter(|t| t.metric() == name)
                .filter_map(|t| match t.expression().statistic {
                    Statistic::Percentile(p) if ![50.0, 90.0, 95.0, 99.0].contains(&p) => Some(p),
                    _ => None,
                })
                .collect();
            (name.to_string(), MetricSummary::from_series(series, &extra))
        })
        .collect()
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub reason: CompletionReason,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub vus_spawned: u64,
    pub peak_vus: u32,
    pub lost_workers: u64,
    pub lost_samples: u64,
    pub iterations: u64,
    pub evaluation_cycles: u64,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    /// Process exit status: 0 when passed, 99 when a threshold failed
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            EXIT_PASSED
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    pub fn threshold(&self, metric: &str, expression: &str) -> Option<&ThresholdResult> {
        self.thresholds
            .iter()
            .find(|t| t.metric == metric && t.expression == expression)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({})", self.name, self.run_id)?;
        writeln!(f, "   Verdict:         {}", self.verdict)?;
        writeln!(f, "   Completion:      {}", self.reason)?;
        writeln!(f, "   Duration:        {:.2}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "   Iterations:      {}", self.iterations)?;
        writeln!(
            f,
            "   Virtual users:   {} spawned, peak {}, {} lost",
            self.vus_spawned, self.peak_vus, self.lost_workers
        )?;
        if self.lost_samples > 0 {
            writeln!(f, "   Lost samples:    {}", self.lost_samples)?;
        }

        for (name, metric) in &self.metrics {
            writeln!(f)?;
            writeln!(
                f,
                "   {}: count={} failed={:.2}%",
                name,
                metric.count,
                metric.failure_rate * 100.0
            )?;
            writeln!(
                f,
                "     avg={:.2} min={:.2} med={:.2} p90={:.2} p95={:.2} p99={:.2} max={:.2}",
                metric.mean, metric.min, metric.p50, metric.p90, metric.p95, metric.p99, metric.max
            )?;
            if !metric.errors.is_empty() {
                let errors: Vec<String> = metric
                    .errors
                    .iter()
                    .map(|(kind, count)| format!("{}={}", kind, count))
                    .collect();
                writeln!(f, "     errors: {}", errors.join(" "))?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "   Thresholds:")?;
            for threshold in &self.thresholds {
                let mark = match threshold.state {
                    ThresholdState::Passed => "ok",
                    ThresholdState::Breached => "FAIL",
                    ThresholdState::NotEvaluable => "--",
                };
                write!(f, "     [{}] {} {}", mark, threshold.metric, threshold.expression)?;
                match threshold.observed {
                    Some(observed) => writeln!(f, " (observed {:.4})", observed)?,
                    None => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

//! Threshold definitions and periodic evaluation

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::expression::{ThresholdExpr, ThresholdParseError};
use crate::error::ConfigError;
use crate::metrics::{AggregateSnapshot, Aggregator};

/// A pass/fail rule on one metric
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    metric: String,
    source: String,
    expression: ThresholdExpr,
    abort_on_breach: bool,
}

impl Threshold {
    /// Parse `expression` into a threshold on `metric`
    pub fn new(
        metric: impl Into<String>,
        expression: &str,
    ) -> Result<Self, ThresholdParseError> {
        Ok(Self {
            metric: metric.into(),
            source: expression.trim().to_string(),
            expression: expression.parse()?,
            abort_on_breach: false,
        })
    }

    /// Abort the run as soon as this threshold is breached
    pub fn with_abort_on_breach(mut self, abort: bool) -> Self {
        self.abort_on_breach = abort;
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Expression as written by the user
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expression(&self) -> &ThresholdExpr {
        &self.expression
    }

    pub fn abort_on_breach(&self) -> bool {
        self.abort_on_breach
    }
}

/// Serializable threshold definition
///
/// ```
/// use surge_engine::threshold::ThresholdConfig;
///
/// let config: ThresholdConfig = serde_json::from_str(
///     r#"{"metric": "http_req_duration", "expression": "p(90)<50", "abort_on_breach": true}"#,
/// ).unwrap();
/// assert!(config.to_threshold().unwrap().abort_on_breach());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    pub metric: String,
    pub expression: String,
    #[serde(default)]
    pub abort_on_breach: bool,
}

impl ThresholdConfig {
    pub fn new(metric: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            expression: expression.into(),
            abort_on_breach: false,
        }
    }

    pub fn with_abort_on_breach(mut self, abort: bool) -> Self {
        self.abort_on_breach = abort;
        self
    }

    /// Parse into a [`Threshold`]
    pub fn to_threshold(&self) -> Result<Threshold, ConfigError> {
        Threshold::new(&self.metric, &self.expression)
            .map(|t| t.with_abort_on_breach(self.abort_on_breach))
            .map_err(|source| ConfigError::InvalidThreshold {
                metric: self.metric.clone(),
                expression: self.expression.clone(),
                source,
            })
    }
}

/// Last evaluated state of a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdState {
    /// The metric has no samples yet
    NotEvaluable,
    Passed,
    Breached,
}

impl std::fmt::Display for ThresholdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEvaluable => write!(f, "not evaluable"),
            Self::Passed => write!(f, "passed"),
            Self::Breached => write!(f, "breached"),
        }
    }
}

/// Outcome of one threshold after the latest cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub abort_on_breach: bool,
    pub state: ThresholdState,
    /// Statistic value seen in the latest evaluable cycle
    pub observed: Option<f64>,
}

/// Request to abort the run, raised by an `abort_on_breach` threshold
#[derive(Debug, Clone, PartialEq)]
pub struct AbortTrigger {
    pub metric: String,
    pub expression: String,
    pub observed: f64,
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationCycle {
    pub cycle: u64,
    /// The snapshot was older than the previous one and was ignored
    pub stale: bool,
    pub breached: usize,
    pub abort: Option<AbortTrigger>,
}

/// Evaluates thresholds against aggregate snapshots
///
/// States reflect the most recent non-stale cycle, except that a threshold
/// which triggered an abort stays breached.
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    thresholds: Vec<Threshold>,
    results: Vec<ThresholdResult>,
    latched: Vec<bool>,
    last_total: u64,
    cycles: u64,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        let results = thresholds
            .iter()
            .map(|t| ThresholdResult {
                metric: t.metric.clone(),
                expression: t.source.clone(),
                abort_on_breach: t.abort_on_breach,
                state: ThresholdState::NotEvaluable,
                observed: None,
            })
            .collect();
        let latched = vec![false; thresholds.len()];

        Self {
            thresholds,
            results,
            latched,
            last_total: 0,
            cycles: 0,
        }
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Number of non-stale cycles run so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Evaluate every threshold against `snapshot`
    pub fn evaluate(&mut self, snapshot: &AggregateSnapshot) -> EvaluationCycle {
        let total = snapshot.total_samples();
        if total < self.last_total {
            debug!(total, last_total = self.last_total, "Ignoring stale snapshot");
            return EvaluationCycle {
                cycle: self.cycles,
                stale: true,
                breached: self.breached_count(),
                abort: None,
            };
        }
        self.last_total = total;
        self.cycles += 1;

        let mut abort = None;
        for (index, threshold) in self.thresholds.iter().enumerate() {
            let result = &mut self.results[index];

            let series = match snapshot.get(&threshold.metric) {
                Some(series) if series.count > 0 => series,
                _ => {
                    if !self.latched[index] {
                        result.state = ThresholdState::NotEvaluable;
                    }
                    continue;
                }
            };

            if self.latched[index] {
                continue;
            }

            let observed = threshold.expression.observe(series);
            result.observed = Some(observed);

            if threshold.expression.is_satisfied_by(observed) {
                result.state = ThresholdState::Passed;
                continue;
            }

            if result.state != ThresholdState::Breached {
                warn!(
                    metric = %threshold.metric,
                    expression = %threshold.source,
                    observed,
                    "Threshold breached"
                );
            }
            result.state = ThresholdState::Breached;

            if threshold.abort_on_breach {
                self.latched[index] = true;
                if abort.is_none() {
                    abort = Some(AbortTrigger {
                        metric: threshold.metric.clone(),
                        expression: threshold.source.clone(),
                        observed,
                    });
                }
            }
        }

        let breached = self.breached_count();
        debug!(cycle = self.cycles, total, breached, "Evaluation cycle complete");

        EvaluationCycle {
            cycle: self.cycles,
            stale: false,
            breached,
            abort,
        }
    }

    /// Current per-threshold results, in declaration order
    pub fn results(&self) -> Vec<ThresholdResult> {
        self.results.clone()
    }

    /// No threshold is breached
    ///
    /// A threshold that never became evaluable does not fail the run.
    pub fn passed(&self) -> bool {
        self.breached_count() == 0
    }

    fn breached_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.state == ThresholdState::Breached)
            .count()
    }
}

/// Evaluate on every `interval` tick until `shutdown` is cancelled
///
/// The first `abort_on_breach` breach is sent on `abort_tx`; the evaluator is
/// handed back so the caller can run the final cycle.
pub(crate) async fn evaluation_loop(
    mut evaluator: ThresholdEvaluator,
    aggregator: Arc<Aggregator>,
    interval: Duration,
    abort_tx: mpsc::Sender<AbortTrigger>,
    shutdown: CancellationToken,
) -> ThresholdEvaluator {
    if evaluator.thresholds.is_empty() {
        debug!("No thresholds configured, evaluation loop idle");
        shutdown.cancelled().await;
        return evaluator;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut abort_sent = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cycle = evaluator.evaluate(&aggregator.snapshot());
                if let Some(trigger) = cycle.abort {
                    if !abort_sent {
                        abort_sent = true;
                        if let Err(e) = abort_tx.try_send(trigger) {
                            warn!("Failed to deliver abort trigger: {}", e);
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Evaluation loop: shutdown requested");
                break;
            }
        }
    }

    debug!(cycles = evaluator.cycles(), "Evaluation loop exited");
    evaluator
}

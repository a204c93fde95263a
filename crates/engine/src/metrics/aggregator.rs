//! Sharded sample aggregation
//!
//! Writers are spread over independent shards so that hundreds of virtual
//! users reporting the same metric do not contend on one lock. Shards are
//! merged when a snapshot is taken.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::series::{MetricSeries, SeriesSnapshot};
use super::{Sample, ERROR_TAG};
use crate::error::ConfigError;

/// Largest scaled value accepted by the histogram
const MAX_SCALED_VALUE: u64 = u64::MAX / 2;

/// Aggregator configuration
///
/// # Example
///
/// ```
/// use surge_engine::metrics::AggregatorConfig;
///
/// let config = AggregatorConfig::default()
///     .with_shards(64)
///     .with_significant_figures(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Number of independent ingestion shards
    pub shards: usize,

    /// HdrHistogram precision (1-5); relative error is `10^-significant_figures`
    pub significant_figures: u8,

    /// Multiplier applied to values before they enter the histogram
    /// (1000.0 keeps microsecond resolution for millisecond values)
    pub value_scale: f64,

    /// Maximum number of distinct metric names
    pub max_series: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            shards: 32,
            significant_figures: 3,
            value_scale: 1000.0,
            max_series: 1024,
        }
    }
}

impl AggregatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shard count
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Set histogram precision
    pub fn with_significant_figures(mut self, figures: u8) -> Self {
        self.significant_figures = figures;
        self
    }

    /// Set the value scale
    pub fn with_value_scale(mut self, scale: f64) -> Self {
        self.value_scale = scale;
        self
    }

    /// Set the distinct metric cap
    pub fn with_max_series(mut self, max: usize) -> Self {
        self.max_series = max;
        self
    }

    /// Relative error bound of reported percentiles
    pub fn relative_error(&self) -> f64 {
        10f64.powi(-(self.significant_figures as i32))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::InvalidAggregator("shards must be at least 1".into()));
        }
        if !(1..=5).contains(&self.significant_figures) {
            return Err(ConfigError::InvalidAggregator(format!(
                "significant_figures must be within 1..=5, got {}",
                self.significant_figures
            )));
        }
        if !self.value_scale.is_finite() || self.value_scale <= 0.0 {
            return Err(ConfigError::InvalidAggregator(format!(
                "value_scale must be a positive number, got {}",
                self.value_scale
            )));
        }
        if self.max_series == 0 {
            return Err(ConfigError::InvalidAggregator(
                "max_series must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Reasons a sample was dropped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    /// NaN, infinite or negative value
    #[error("value {value} for metric '{metric}' is not a finite non-negative number")]
    InvalidValue { metric: String, value: f64 },

    /// Value too large for the estimator
    #[error("value {value} for metric '{metric}' exceeds the trackable range")]
    OutOfRange { metric: String, value: f64 },

    /// Distinct metric cap reached
    #[error("series limit of {limit} reached, dropping metric '{metric}'")]
    SeriesLimit { metric: String, limit: usize },

    /// Estimator rejected the value
    #[error("histogram error for metric '{metric}': {reason}")]
    Histogram { metric: String, reason: String },
}

type Shard = HashMap<String, MetricSeries>;

/// Concurrent sample aggregator
///
/// `ingest` is lossless for valid samples: every accepted sample is counted
/// exactly once. Rejected samples are dropped and counted in
/// [`AggregateSnapshot::lost_samples`].
pub struct Aggregator {
    config: AggregatorConfig,
    shards: Box<[Mutex<Shard>]>,
    names: RwLock<HashSet<String>>,
    next_shard: AtomicUsize,
    lost_samples: AtomicU64,
}

impl Aggregator {
    /// Create a new aggregator
    pub fn new(config: AggregatorConfig) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(Shard::new()))
            .collect();

        Self {
            config,
            shards,
            names: RwLock::new(HashSet::new()),
            next_shard: AtomicUsize::new(0),
            lost_samples: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Ingest a sample into a rotating shard
    pub fn ingest(&self, sample: Sample) -> Result<(), IngestError> {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed);
        self.ingest_on(shard, sample)
    }

    /// Ingest a sample into the shard selected by `shard_hint`
    ///
    /// Executors pass their VU id so that one VU always writes to the same shard.
    pub fn ingest_on(&self, shard_hint: usize, sample: Sample) -> Result<(), IngestError> {
        let index = shard_hint % self.shards.len();
        let result = self.try_ingest(index, &sample);
        if let Err(ref error) = result {
            self.record_lost(error);
        }
        result
    }

    /// Number of samples dropped so far
    pub fn lost_samples(&self) -> u64 {
        self.lost_samples.load(Ordering::Relaxed)
    }

    /// Merge every shard into a read-consistent copy
    ///
    /// Each shard is locked once; a sample is either fully visible or not at
    /// all. Counts never decrease between successive snapshots.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let mut merged: BTreeMap<String, MetricSeries> = BTreeMap::new();

        for shard in self.shards.iter() {
            let shard = shard.lock();
            for (name, series) in shard.iter() {
                match merged.get_mut(name) {
                    Some(acc) => {
                        if let Err(e) = acc.merge(series) {
                            warn!(metric = %name, error = %e, "Failed to merge histogram shard");
                        }
                    }
                    None => {
                        merged.insert(name.clone(), series.clone());
                    }
                }
            }
        }

        let scale = self.config.value_scale;
        AggregateSnapshot {
            series: merged
                .into_iter()
                .map(|(name, series)| (name, series.snapshot(scale)))
                .collect(),
            lost_samples: self.lost_samples(),
        }
    }

    fn try_ingest(&self, index: usize, sample: &Sample) -> Result<(), IngestError> {
        let metric = sample.metric();
        let value = sample.value();
        let scaled = self.scale(metric, value)?;
        let error = sample.tags().get(ERROR_TAG).map(String::as_str);

        let mut shard = self.shards[index].lock();
        if let Some(series) = shard.get_mut(metric) {
            return series
                .record(value, scaled, sample.outcome(), error)
                .map_err(|e| IngestError::Histogram {
                    metric: metric.to_string(),
                    reason: e.to_string(),
                });
        }

        self.register_name(metric)?;

        let mut series =
            MetricSeries::new(self.config.significant_figures).map_err(|e| {
                IngestError::Histogram {
                    metric: metric.to_string(),
                    reason: e.to_string(),
                }
            })?;
        series
            .record(value, scaled, sample.outcome(), error)
            .map_err(|e| IngestError::Histogram {
                metric: metric.to_string(),
                reason: e.to_string(),
            })?;
        shard.insert(metric.to_string(), series);
        Ok(())
    }

    fn scale(&self, metric: &str, value: f64) -> Result<u64, IngestError> {
        if !value.is_finite() || value < 0.0 {
            return Err(IngestError::InvalidValue {
                metric: metric.to_string(),
                value,
            });
        }
        let scaled = (value * self.config.value_scale).round();
        if scaled >= MAX_SCALED_VALUE as f64 {
            return Err(IngestError::OutOfRange {
                metric: metric.to_string(),
                value,
            });
        }
        Ok(scaled as u64)
    }

    fn register_name(&self, metric: &str) -> Result<(), IngestError> {
        if self.names.read().contains(metric) {
            return Ok(());
        }

        let mut names = self.names.write();
        if names.contains(metric) {
            return Ok(());
        }
        if names.len() >= self.config.max_series {
            return Err(IngestError::SeriesLimit {
                metric: metric.to_string(),
                limit: self.config.max_series,
            });
        }
        names.insert(metric.to_string());
        Ok(())
    }

    fn record_lost(&self, error: &IngestError) {
        let previous = self.lost_samples.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            warn!(error = %error, "Dropping sample; further drops are only counted");
        } else {
            debug!(error = %error, "Dropping sample");
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

/// Read-consistent copy of all series
#[derive(Debug, Clone, Default)]
pub struct AggregateSnapshot {
    series: BTreeMap<String, SeriesSnapshot>,
    lost_samples: u64,
}

impl AggregateSnapshot {
    /// Statistics for one metric, if it has samples
    pub fn get(&self, metric: &str) -> Option<&SeriesSnapshot> {
        self.series.get(metric)
    }

    /// Iterate series in metric-name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SeriesSnapshot)> {
        self.series.iter().map(|(name, series)| (name.as_str(), series))
    }

    /// Sum of sample counts over every series
    pub fn total_samples(&self) -> u64 {
        self.series.values().map(|s| s.count).sum()
    }

    pub fn lost_samples(&self) -> u64 {
        self.lost_samples
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

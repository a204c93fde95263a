//! Run configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metrics::AggregatorConfig;
use crate::ramp::{RampProfile, Stage};
use crate::serde_helpers::{duration_millis, option_duration_millis};
use crate::threshold::{Threshold, ThresholdConfig};
use crate::vu::PacingPolicy;

/// Everything needed to execute one load run
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use surge_engine::run::RunConfig;
/// use surge_engine::vu::PacingPolicy;
///
/// let config = RunConfig::new("buy_item")
///     .with_stage(Duration::from_secs(30), 20)
///     .with_stage(Duration::from_secs(60), 20)
///     .with_stage(Duration::from_secs(30), 0)
///     .with_pacing(PacingPolicy::fixed(Duration::from_secs(1)))
///     .with_threshold("http_req_duration", "p(90)<50")
///     .with_abort_threshold("checks", "rate<0.0001");
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.total_duration(), Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Human-readable run name
    pub name: String,

    /// Ramp profile
    pub stages: RampProfile,

    /// Pass/fail rules
    pub thresholds: Vec<ThresholdConfig>,

    /// Delay between iterations of one virtual user
    pub pacing: PacingPolicy,

    /// Ramp scheduler tick
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Threshold evaluation period
    #[serde(with = "duration_millis")]
    pub evaluation_interval: Duration,

    /// Hard cap on concurrent virtual users
    pub max_vus: u32,

    /// Iterations running longer are recorded as timed-out failures
    #[serde(with = "option_duration_millis")]
    pub max_iteration_duration: Option<Duration>,

    /// Aggregator settings
    pub aggregator: AggregatorConfig,

    /// Seed for jittered pacing; entropy when unset
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            stages: RampProfile::default(),
            thresholds: Vec::new(),
            pacing: PacingPolicy::None,
            tick_interval: Duration::from_millis(100),
            evaluation_interval: Duration::from_secs(1),
            max_vus: 10_000,
            max_iteration_duration: None,
            aggregator: AggregatorConfig::default(),
            seed: None,
        }
    }
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a ramp stage
    pub fn with_stage(mut self, duration: Duration, target: u32) -> Self {
        self.stages.push(Stage::new(duration, target));
        self
    }

    /// Replace the ramp profile
    pub fn with_stages(mut self, stages: impl Into<RampProfile>) -> Self {
        self.stages = stages.into();
        self
    }

    /// Add a threshold that fails the run when breached
    pub fn with_threshold(mut self, metric: impl Into<String>, expression: impl Into<String>) -> Self {
        self.thresholds.push(ThresholdConfig::new(metric, expression));
        self
    }

    /// Add a threshold that aborts the run as soon as it is breached
    pub fn with_abort_threshold(
        mut self,
        metric: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.thresholds
            .push(ThresholdConfig::new(metric, expression).with_abort_on_breach(true));
        self
    }

    pub fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }

    pub fn with_max_vus(mut self, max_vus: u32) -> Self {
        self.max_vus = max_vus;
        self
    }

    pub fn with_max_iteration_duration(mut self, limit: Duration) -> Self {
        self.max_iteration_duration = Some(limit);
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Total run duration
    pub fn total_duration(&self) -> Duration {
        self.stages.total_duration()
    }

    /// Parse every threshold
    pub fn parse_thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.thresholds.iter().map(ThresholdConfig::to_threshold).collect()
    }

    /// Validate the configuration
    ///
    /// Threshold metric names are checked later, against the workload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "tick_interval must be greater than zero".into(),
            ));
        }
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "evaluation_interval must be greater than zero".into(),
            ));
        }
        if self.max_iteration_duration == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidInterval(
                "max_iteration_duration must be greater than zero".into(),
            ));
        }

        self.stages.validate()?;
        self.pacing.validate()?;
        self.aggregator.validate()?;

        let requested = self.stages.max_target();
        if requested > self.max_vus {
            return Err(ConfigError::ConcurrencyCapExceeded {
                requested,
                cap: self.max_vus,
            });
        }

        self.parse_thresholds()?;
        Ok(())
    }
}

//! Stages and ramp profiles

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::serde_helpers::duration_millis;

/// One ramp segment: reach `target` virtual users by the end of `duration`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Ordered stages describing target concurrency over time
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use surge_engine::ramp::{RampProfile, Stage};
///
/// let profile = RampProfile::new(vec![
///     Stage::new(Duration::from_secs(10), 1000),
///     Stage::new(Duration::from_secs(60), 1000),
///     Stage::new(Duration::from_secs(10), 0),
/// ]);
/// assert_eq!(profile.target_at(Duration::from_secs(5)), 500);
/// assert_eq!(profile.target_at(Duration::from_secs(75)), 500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RampProfile {
    stages: Vec<Stage>,
}

impl RampProfile {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Append a stage
    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Sum of every stage duration (saturating)
    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration))
    }

    /// Highest target across all stages
    pub fn max_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target concurrency at `elapsed`
    ///
    /// Linear interpolation from the previous stage's target (0 before the
    /// first stage), rounded to the nearest integer. Zero-length stages jump
    /// straight to their target. At or past the end, the last target holds.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = 0u32;
        let mut start = Duration::ZERO;

        for stage in &self.stages {
            if stage.duration.is_zero() {
                from = stage.target;
                continue;
            }

            let end = start.saturating_add(stage.duration);
            if elapsed < end {
                let progress =
                    (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = stage.target as f64 - from as f64;
                let value = from as f64 + delta * progress;
                return value.round().clamp(0.0, u32::MAX as f64) as u32;
            }

            from = stage.target;
            start = end;
        }

        self.stages.last().map(|s| s.target).unwrap_or(0)
    }

    /// Index of the stage whose window contains `elapsed`
    ///
    /// `None` once the profile has finished (or when it is empty).
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                continue;
            }
            let end = start.saturating_add(stage.duration);
            if elapsed < end {
                return Some(index);
            }
            start = end;
        }
        None
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut total = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            total = total.checked_add(stage.duration).ok_or_else(|| {
                ConfigError::InvalidProfile(format!(
                    "total duration overflows at stage {}",
                    index
                ))
            })?;
        }
        Ok(())
    }
}

impl From<Vec<Stage>> for RampProfile {
    fn from(stages: Vec<Stage>) -> Self {
        Self::new(stages)
    }
}

impl FromIterator<Stage> for RampProfile {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

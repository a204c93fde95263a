//! Delay between iterations

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::VirtualUserId;
use crate::error::ConfigError;
use crate::serde_helpers::duration_millis;

/// How long a virtual user waits after each iteration
///
/// ```
/// use surge_engine::vu::PacingPolicy;
///
/// let pacing: PacingPolicy =
///     serde_json::from_str(r#"{"type": "jitter", "min": 500, "max": 1500}"#).unwrap();
/// assert!(pacing.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacingPolicy {
    /// Start the next iteration immediately
    #[default]
    None,

    /// Constant delay
    Fixed {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },

    /// Uniformly distributed delay in `[min, max]`
    Jitter {
        #[serde(with = "duration_millis")]
        min: Duration,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
}

impl PacingPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn jitter(min: Duration, max: Duration) -> Self {
        Self::Jitter { min, max }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Self::Jitter { min, max } = self {
            if min > max {
                return Err(ConfigError::InvalidPacing(format!(
                    "jitter min {:?} is greater than max {:?}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// Per-VU delay generator
pub(crate) struct Pacer {
    policy: PacingPolicy,
    rng: StdRng,
}

impl Pacer {
    /// With a run seed, each virtual user gets its own reproducible stream
    pub(crate) fn new(policy: PacingPolicy, seed: Option<u64>, vu: VirtualUserId) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ vu.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        Self { policy, rng }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        match self.policy {
            PacingPolicy::None => Duration::ZERO,
            PacingPolicy::Fixed { delay } => delay,
            PacingPolicy::Jitter { min, max } => {
                let low = saturating_nanos(min);
                let high = saturating_nanos(max).max(low);
                Duration::from_nanos(self.rng.gen_range(low..=high))
            }
        }
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

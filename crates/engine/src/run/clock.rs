//! Run clock

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in deadline for durations past what `Instant` can represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Monotonic clock shared by the scheduler, evaluator and controller
///
/// Built on `tokio::time::Instant`, so paused-time tests drive it.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    /// Start the clock now
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Instant `after` the start
    ///
    /// Durations too large for `Instant` map to a deadline thirty years out.
    pub fn deadline(&self, after: Duration) -> Instant {
        self.start
            .checked_add(after)
            .or_else(|| self.start.checked_add(FAR_FUTURE))
            .unwrap_or(self.start)
    }
}

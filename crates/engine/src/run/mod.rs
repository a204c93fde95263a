//! Run lifecycle: configuration, clock, state and the controller

mod clock;
mod config;
mod controller;
mod state;
mod summary;

pub use clock::RunClock;
pub use config::RunConfig;
pub use controller::{AbortHandle, RunController};
pub use state::{RunPhase, RunState, Verdict};
pub use summary::{
    CompletionReason, MetricSummary, RunSummary, EXIT_PASSED, EXIT_THRESHOLDS_FAILED,
};

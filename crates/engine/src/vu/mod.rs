//! Virtual users
//!
//! A virtual user is one simulated client looping over the workload. Each is
//! driven by its own executor task and owns its state exclusively.

mod executor;
mod pacing;
mod reporter;
mod workload;

use tokio::time::Instant;

pub(crate) use executor::{ExecutorExit, ExecutorSettings, VirtualUserExecutor};
pub use pacing::PacingPolicy;
pub use reporter::Reporter;
pub use workload::{workload_fn, FnWorkload, Workload, WorkloadError};

/// 1-based virtual user id, never reused within a run
pub type VirtualUserId = u64;

/// Bookkeeping for one virtual user
#[derive(Debug, Clone)]
pub struct VirtualUser {
    id: VirtualUserId,
    iteration_count: u64,
    last_iteration_start: Option<Instant>,
}

impl VirtualUser {
    pub fn new(id: VirtualUserId) -> Self {
        Self {
            id,
            iteration_count: 0,
            last_iteration_start: None,
        }
    }

    pub fn id(&self) -> VirtualUserId {
        self.id
    }

    /// Completed iterations
    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    pub fn last_iteration_start(&self) -> Option<Instant> {
        self.last_iteration_start
    }

    pub(crate) fn begin_iteration(&mut self) -> Instant {
        let now = Instant::now();
        self.last_iteration_start = Some(now);
        now
    }

    pub(crate) fn complete_iteration(&mut self) {
        self.iteration_count += 1;
    }
}

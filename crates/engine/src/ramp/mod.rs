//! Staged concurrency ramping
//!
//! A [`RampProfile`] maps elapsed run time to a target number of virtual
//! users. The scheduler ticks periodically, compares the target with the
//! current roster and spawns or retires executors to close the gap.

mod scheduler;
mod stage;

pub(crate) use scheduler::{RampScheduler, StopMode};
pub use scheduler::{reconcile, Reconcile, SchedulerReport};
pub use stage::{RampProfile, Stage};

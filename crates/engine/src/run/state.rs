//! Observable run state

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_helpers::duration_millis;
use crate::vu::VirtualUserId;

/// Lifecycle phase of a run
///
/// ```text
/// ┌──────────────┐  setup ok  ┌─────────┐  abort   ┌──────────┐
/// │ Initializing │ ─────────► │ Running │ ───────► │ Aborting │
/// └──────────────┘            └─────────┘          └──────────┘
///                                  │ profile done        │ all VUs retired
///                                  ▼                     │
///                             ┌───────────┐              │
///                             │ Completed │ ◄────────────┘
///                             └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initializing,
    Running,
    Aborting,
    Completed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Aborting => write!(f, "aborting"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Overall pass/fail result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a run, published to subscribers on every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Index of the active stage, `None` before start and after the last stage
    pub current_stage: Option<usize>,
    pub active_vus: BTreeSet<VirtualUserId>,
    /// Once set, no further virtual users are spawned
    pub aborted: bool,
    pub verdict: Verdict,
    pub phase: RunPhase,
    pub lost_workers: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            elapsed: Duration::ZERO,
            current_stage: None,
            active_vus: BTreeSet::new(),
            aborted: false,
            verdict: Verdict::Pending,
            phase: RunPhase::Initializing,
            lost_workers: 0,
        }
    }
}

impl RunState {
    pub fn active_count(&self) -> usize {
        self.active_vus.len()
    }

    pub fn is_completed(&self) -> bool {
        self.phase == RunPhase::Completed
    }

    /// Assign the verdict; only the first assignment takes effect
    pub fn set_verdict(&mut self, verdict: Verdict) -> bool {
        if self.verdict != Verdict::Pending || verdict == Verdict::Pending {
            return false;
        }
        self.verdict = verdict;
        true
    }
}

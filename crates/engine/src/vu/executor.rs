//! Per-VU iteration loop

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::pacing::{Pacer, PacingPolicy};
use super::{Reporter, VirtualUser, VirtualUserId, Workload};
use crate::metrics::{Aggregator, Outcome, Sample, ERROR_TAG, ITERATION_DURATION};

/// Settings shared by every executor of a run
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutorSettings {
    pub pacing: PacingPolicy,
    pub seed: Option<u64>,
    pub max_iteration_duration: Option<Duration>,
}

/// How an executor ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecutorExit {
    /// Stopped cooperatively after its last iteration
    Retired {
        id: VirtualUserId,
        iterations: u64,
    },
    /// Never started iterating because `init_vu` failed
    Lost { id: VirtualUserId, reason: String },
}

#[cfg(test)]
impl ExecutorExit {
    pub(crate) fn iterations(&self) -> u64 {
        match self {
            Self::Retired { iterations, .. } => *iterations,
            Self::Lost { .. } => 0,
        }
    }
}

/// Result of one guarded workload call
struct IterationResult {
    outcome: Outcome,
    error: Option<String>,
}

/// Runs one workload instance until its token is cancelled
///
/// Cancellation is only observed between iterations and during pacing; a
/// running iteration always completes (or times out).
pub(crate) struct VirtualUserExecutor<W: Workload> {
    user: VirtualUser,
    workload: Arc<W>,
    reporter: Reporter,
    pacer: Pacer,
    max_iteration_duration: Option<Duration>,
    token: CancellationToken,
}

impl<W: Workload> VirtualUserExecutor<W> {
    pub(crate) fn new(
        id: VirtualUserId,
        workload: Arc<W>,
        aggregator: Arc<Aggregator>,
        settings: &ExecutorSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            user: VirtualUser::new(id),
            workload,
            reporter: Reporter::new(aggregator, id),
            pacer: Pacer::new(settings.pacing, settings.seed, id),
            max_iteration_duration: settings.max_iteration_duration,
            token,
        }
    }

    #[instrument(skip(self), fields(vu = self.user.id()))]
    pub(crate) async fn run(mut self) -> ExecutorExit {
        let id = self.user.id();

        let init = AssertUnwindSafe(self.workload.init_vu(id)).catch_unwind().await;
        let mut state = match init {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                debug!(vu = id, error = %e, "Virtual user failed to initialize, worker lost");
                return ExecutorExit::Lost {
                    id,
                    reason: e.to_string(),
                };
            }
            Err(_) => {
                debug!(vu = id, "Virtual user panicked during initialization, worker lost");
                return ExecutorExit::Lost {
                    id,
                    reason: "panic in init_vu".to_string(),
                };
            }
        };

        debug!(vu = id, "Virtual user started");

        while !self.token.is_cancelled() {
            let started = self.user.begin_iteration();
            let result = self.iterate(&mut state).await;
            let elapsed = started.elapsed();
            self.user.complete_iteration();

            let mut sample = Sample::new(
                ITERATION_DURATION,
                elapsed.as_secs_f64() * 1000.0,
                result.outcome,
            );
            if let Some(kind) = result.error {
                sample = sample.with_tag(ERROR_TAG, kind);
            }
            self.reporter.report_sample(sample);

            self.pace().await;
        }

        debug!(
            vu = id,
            iterations = self.user.iteration_count(),
            "Virtual user retired"
        );
        ExecutorExit::Retired {
            id,
            iterations: self.user.iteration_count(),
        }
    }

    /// Call the workload once, containing errors, panics and timeouts
    async fn iterate(&self, state: &mut W::VuState) -> IterationResult {
        let id = self.user.id();
        let call = AssertUnwindSafe(self.workload.iteration(id, state, &self.reporter))
            .catch_unwind();

        let result = match self.max_iteration_duration {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(vu = id, limit_ms = limit.as_millis() as u64, "Iteration timed out");
                    return IterationResult {
                        outcome: Outcome::Failure,
                        error: Some("timeout".to_string()),
                    };
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(outcome)) => IterationResult {
                outcome,
                error: None,
            },
            Ok(Err(e)) => {
                debug!(vu = id, error = %e, "Iteration failed");
                IterationResult {
                    outcome: Outcome::Failure,
                    error: Some(e.kind().to_string()),
                }
            }
            Err(_) => {
                warn!(vu = id, "Iteration panicked");
                IterationResult {
                    outcome: Outcome::Failure,
                    error: Some("panic".to_string()),
                }
            }
        }
    }

    /// Wait out the pacing delay; retirement cuts it short
    async fn pace(&mut self) {
        let delay = self.pacer.next_delay();
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.token.cancelled() => {}
        }
    }
}

//! Run orchestration

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::summary::{summarize_metrics, CompletionReason, RunSummary};
use super::{RunClock, RunConfig, RunPhase, RunState, Verdict};
use crate::error::{ConfigError, RunError};
use crate::metrics::{Aggregator, RESERVED_METRICS};
use crate::ramp::{RampScheduler, StopMode};
use crate::threshold::{evaluation_loop, Threshold, ThresholdEvaluator};
use crate::vu::{ExecutorSettings, Workload};

/// Requests an early stop of a running test
///
/// Cloneable; aborting more than once has no further effect.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Drives one load run from initialization to verdict
///
/// # Example
///
/// ```ignore
/// use surge_engine::prelude::*;
///
/// let config = RunConfig::new("login")
///     .with_stage(Duration::from_secs(30), 20)
///     .with_stage(Duration::from_secs(30), 0)
///     .with_abort_threshold("checks", "rate<0.0001");
///
/// let controller = RunController::new(config, LoginWorkload::new(base_url));
/// let abort = controller.abort_handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     abort.abort();
/// });
///
/// let summary = controller.run().await?;
/// println!("{}", summary);
/// std::process::exit(summary.exit_code());
/// ```
pub struct RunController<W: Workload> {
    run_id: Uuid,
    config: RunConfig,
    workload: Arc<W>,
    aggregator: Arc<Aggregator>,
    state: Arc<watch::Sender<RunState>>,
    operator: CancellationToken,
}

impl<W: Workload> RunController<W> {
    pub fn new(config: RunConfig, workload: W) -> Self {
        let aggregator = Arc::new(Aggregator::new(config.aggregator.clone()));
        let (state, _) = watch::channel(RunState::default());

        Self {
            run_id: Uuid::now_v7(),
            config,
            workload: Arc::new(workload),
            aggregator,
            state: Arc::new(state),
            operator: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Handle for operator-initiated aborts
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.operator.clone(),
        }
    }

    /// Observe run state changes
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Live aggregator, for observers that want intermediate snapshots
    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Execute the run
    ///
    /// Returns an error only if the run could not start (configuration or
    /// setup) or a controller task died; threshold failures are reported in
    /// the summary's verdict.
    #[instrument(skip(self), fields(run_id = %self.run_id, run = %self.config.name))]
    pub async fn run(self) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        info!(phase = %RunPhase::Initializing, "Initializing run");

        let thresholds = self.initialize().map_err(|e| {
            error!(error = %e, "Run configuration rejected");
            RunError::Config(e)
        })?;

        if let Err(e) = self.workload.setup().await {
            error!(error = %e, "Workload setup failed");
            return Err(RunError::Setup(e));
        }

        let total = self.config.total_duration();
        let clock = RunClock::start();
        self.state.send_modify(|state| state.phase = RunPhase::Running);
        info!(
            phase = %RunPhase::Running,
            duration_ms = total.as_millis() as u64,
            max_target = self.config.stages.max_target(),
            thresholds = thresholds.len(),
            "Run started"
        );

        let run_token = CancellationToken::new();

        let scheduler = RampScheduler::new(
            self.config.stages.clone(),
            Arc::clone(&self.workload),
            Arc::clone(&self.aggregator),
        )
        .with_settings(ExecutorSettings {
            pacing: self.config.pacing,
            seed: self.config.seed,
            max_iteration_duration: self.config.max_iteration_duration,
        })
        .with_tick_interval(self.config.tick_interval)
        .with_cap(self.config.max_vus)
        .with_state(Arc::clone(&self.state))
        .with_token(run_token.child_token());
        let (stop_tx, stop_rx) = oneshot::channel();
        let scheduler_handle = tokio::spawn(scheduler.run(clock, stop_rx));

        let (abort_tx, mut abort_rx) = mpsc::channel(1);
        let evaluator_handle = tokio::spawn(evaluation_loop(
            ThresholdEvaluator::new(thresholds.clone()),
            Arc::clone(&self.aggregator),
            self.config.evaluation_interval,
            abort_tx,
            run_token.child_token(),
        ));

        let reason = tokio::select! {
            biased;
            _ = self.operator.cancelled() => CompletionReason::OperatorAbort,
            Some(trigger) = abort_rx.recv() => CompletionReason::ThresholdAbort {
                metric: trigger.metric,
                expression: trigger.expression,
                observed: trigger.observed,
            },
            _ = tokio::time::sleep_until(clock.deadline(total)) => CompletionReason::DurationElapsed,
        };

        let mode = if reason.is_abort() {
            self.state.send_modify(|state| {
                state.phase = RunPhase::Aborting;
                state.aborted = true;
            });
            warn!(phase = %RunPhase::Aborting, reason = %reason, "Aborting run");
            StopMode::Abort
        } else {
            StopMode::Complete
        };

        // The scheduler only drops its receiver when it has already exited
        let _ = stop_tx.send(mode);
        let scheduler_result = scheduler_handle.await;

        run_token.cancel();
        let evaluator_result = evaluator_handle.await;

        let (report, mut evaluator) = match (scheduler_result, evaluator_result) {
            (Ok(report), Ok(evaluator)) => (report, evaluator),
            (Err(e), _) => return Err(self.task_failed("ramp scheduler", e).await),
            (_, Err(e)) => return Err(self.task_failed("threshold evaluator", e).await),
        };

        let snapshot = self.aggregator.snapshot();
        evaluator.evaluate(&snapshot);
        let verdict = if evaluator.passed() {
            Verdict::Passed
        } else {
            Verdict::Failed
        };

        let elapsed = clock.elapsed();
        self.state.send_modify(|state| {
            state.set_verdict(verdict);
            state.phase = RunPhase::Completed;
            state.elapsed = elapsed;
        });
        info!(
            phase = %RunPhase::Completed,
            verdict = %verdict,
            reason = %reason,
            iterations = report.iterations,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run completed"
        );

        if let Err(e) = self.workload.teardown().await {
            error!(error = %e, "Workload teardown failed");
        }

        Ok(RunSummary {
            run_id: self.run_id,
            name: self.config.name.clone(),
            started_at,
            verdict,
            reason,
            elapsed,
            metrics: summarize_metrics(&snapshot, evaluator.thresholds()),
            thresholds: evaluator.results(),
            vus_spawned: report.spawned,
            peak_vus: report.peak_active,
            lost_workers: report.lost_workers,
            lost_samples: snapshot.lost_samples(),
            iterations: report.iterations,
            evaluation_cycles: evaluator.cycles(),
        })
    }

    /// Validate the configuration and resolve threshold metrics
    fn initialize(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.config.validate()?;
        let thresholds = self.config.parse_thresholds()?;

        let known: HashSet<String> = RESERVED_METRICS
            .iter()
            .map(|name| name.to_string())
            .chain(self.workload.metrics())
            .collect();

        if let Some(unknown) = thresholds.iter().find(|t| !known.contains(t.metric())) {
            return Err(ConfigError::UnknownMetric(unknown.metric().to_string()));
        }
        Ok(thresholds)
    }

    async fn task_failed(&self, task: &str, e: tokio::task::JoinError) -> RunError {
        error!(task, error = %e, "Controller task failed");
        self.state.send_modify(|state| {
            state.set_verdict(Verdict::Failed);
            state.phase = RunPhase::Completed;
        });
        if let Err(e) = self.workload.teardown().await {
            error!(error = %e, "Workload teardown failed");
        }
        RunError::TaskFailed(format!("{}: {}", task, e))
    }
}

//! Abort propagation and per-iteration failure isolation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use surge_engine::metrics::{CHECKS, ITERATION_DURATION};
use surge_engine::prelude::*;

#[test_log::test(tokio::test(start_paused = true))]
async fn test_abort_threshold_stops_run_early() {
    // Every tenth request fails its check
    let counter = Arc::new(AtomicU64::new(0));
    let shared = Arc::clone(&counter);
    let workload = workload_fn(move |_vu, reporter| {
        let n = shared.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let ok = reporter.check("status is 200", n % 10 != 9);
            Ok(Outcome::from_success(ok))
        }
    });

    let config = RunConfig::new("send_coins")
        .with_stage(Duration::from_secs(5), 10)
        .with_stage(Duration::from_secs(60), 10)
        .with_evaluation_interval(Duration::from_millis(200))
        .with_abort_threshold(CHECKS, "rate<0.0001")
        .with_threshold(ITERATION_DURATION, "p(95)<1000");

    let controller = RunController::new(config, workload);
    let state_rx = controller.subscribe();
    let summary = controller.run().await.unwrap();

    match &summary.reason {
        CompletionReason::ThresholdAbort {
            metric,
            expression,
            observed,
        } => {
            assert_eq!(metric, CHECKS);
            assert_eq!(expression, "rate<0.0001");
            assert!(*observed > 0.0001);
        }
        other => panic!("expected threshold abort, got {:?}", other),
    }

    assert!(summary.elapsed < Duration::from_secs(2), "{:?}", summary.elapsed);
    assert_eq!(summary.verdict, Verdict::Failed);
    assert_eq!(summary.exit_code(), 99);

    let abort_rule = summary.threshold(CHECKS, "rate<0.0001").unwrap();
    assert_eq!(abort_rule.state, ThresholdState::Breached);
    assert!(abort_rule.abort_on_breach);

    let state = state_rx.borrow();
    assert!(state.aborted);
    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(state.verdict, Verdict::Failed);
}

/// Records when each iteration starts
struct StartRecorder {
    starts: Arc<Mutex<Vec<Instant>>>,
    iteration: Duration,
}

#[async_trait]
impl Workload for StartRecorder {
    type VuState = ();

    async fn init_vu(&self, _vu: VirtualUserId) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn iteration(
        &self,
        _vu: VirtualUserId,
        _state: &mut (),
        _reporter: &Reporter,
    ) -> Result<Outcome, WorkloadError> {
        self.starts.lock().push(Instant::now());
        tokio::time::sleep(self.iteration).await;
        Ok(Outcome::Success)
    }
}

#[tokio::test(start_paused = true)]
async fn test_no_iteration_starts_after_abort() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let iteration = Duration::from_millis(200);
    let workload = StartRecorder {
        starts: Arc::clone(&starts),
        iteration,
    };

    let pacing = Duration::from_secs(5);
    let config = RunConfig::new("cooperative")
        .with_stage(Duration::ZERO, 20)
        .with_stage(Duration::from_secs(60), 20)
        .with_pacing(PacingPolicy::jitter(Duration::ZERO, pacing))
        .with_seed(99);

    let controller = RunController::new(config, workload);
    let abort = controller.abort_handle();
    let handle = tokio::spawn(controller.run());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let aborted_at = Instant::now();
    abort.abort();
    let summary = handle.await.unwrap().unwrap();
    let finished_at = Instant::now();

    assert_eq!(summary.reason, CompletionReason::OperatorAbort);
    assert!(starts.lock().iter().all(|start| *start <= aborted_at));
    // Pacing is cut short, only in-flight iterations are awaited
    assert!(finished_at - aborted_at <= iteration);
    assert_eq!(summary.iterations, starts.lock().len() as u64);
    assert_eq!(summary.vus_spawned, 20);
}

#[tokio::test(start_paused = true)]
async fn test_errors_and_panics_are_recorded_not_fatal() {
    let counter = Arc::new(AtomicU64::new(0));
    let shared = Arc::clone(&counter);
    let workload = workload_fn(move |_vu, _reporter| {
        let n = shared.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            match n % 4 {
                0 | 1 => Ok(Outcome::Success),
                2 => Err(WorkloadError::new("502 bad gateway").with_kind("http")),
                _ => panic!("unexpected payload"),
            }
        }
    });

    let config = RunConfig::new("flaky")
        .with_stage(Duration::ZERO, 3)
        .with_stage(Duration::from_secs(2), 3)
        .with_threshold(ITERATION_DURATION, "rate<0.6");

    let summary = RunController::new(config, workload).run().await.unwrap();

    assert_eq!(summary.reason, CompletionReason::DurationElapsed);
    assert_eq!(summary.vus_spawned, 3);
    assert_eq!(summary.lost_workers, 0);

    let iterations = summary.metric(ITERATION_DURATION).unwrap();
    assert_eq!(iterations.count, counter.load(Ordering::SeqCst));
    let rate = iterations.failure_rate;
    assert!((rate - 0.5).abs() < 0.05, "failure rate {}", rate);
    assert_eq!(summary.verdict, Verdict::Passed);

    // Call n fails as `http` when n % 4 == 2 and panics when n % 4 == 3
    let calls = counter.load(Ordering::SeqCst);
    let with_remainder = |k: u64| (calls + 3 - k) / 4;
    assert_eq!(iterations.errors["http"], with_remainder(2));
    assert_eq!(iterations.errors["panic"], with_remainder(3));
    assert_eq!(iterations.errors.len(), 2);
    assert_eq!(
        iterations.errors.values().sum::<u64>(),
        iterations.failure_count
    );
    assert!(summary.to_string().contains("errors: http="));
}

#[tokio::test(start_paused = true)]
async fn test_iteration_timeout_recorded() {
    let workload = workload_fn(|_vu, _reporter| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Outcome::Success)
    });

    let config = RunConfig::new("hanging")
        .with_stage(Duration::ZERO, 2)
        .with_stage(Duration::from_secs(1), 2)
        .with_max_iteration_duration(Duration::from_millis(300))
        .with_threshold(ITERATION_DURATION, "rate<0.5");

    let summary = RunController::new(config, workload).run().await.unwrap();

    let iterations = summary.metric(ITERATION_DURATION).unwrap();
    assert!(iterations.count >= 6);
    assert_eq!(iterations.failure_rate, 1.0);
    assert!((iterations.max - 300.0).abs() < 1.0, "max {}", iterations.max);
    assert_eq!(iterations.errors.get("timeout"), Some(&iterations.count));
    assert_eq!(summary.verdict, Verdict::Failed);
}

/// Fails `init_vu` for even ids
struct HalfBroken;

#[async_trait]
impl Workload for HalfBroken {
    type VuState = VirtualUserId;

    async fn init_vu(&self, vu: VirtualUserId) -> Result<VirtualUserId, WorkloadError> {
        if vu % 2 == 0 {
            return Err(WorkloadError::new("login rejected").with_kind("auth"));
        }
        Ok(vu)
    }

    async fn iteration(
        &self,
        vu: VirtualUserId,
        state: &mut VirtualUserId,
        _reporter: &Reporter,
    ) -> Result<Outcome, WorkloadError> {
        assert_eq!(vu, *state);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Outcome::Success)
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_workers_do_not_abort_run() {
    let config = RunConfig::new("half_broken")
        .with_stage(Duration::ZERO, 4)
        .with_stage(Duration::from_secs(1), 4);

    let summary = RunController::new(config, HalfBroken).run().await.unwrap();

    assert_eq!(summary.reason, CompletionReason::DurationElapsed);
    assert_eq!(summary.verdict, Verdict::Passed);
    assert!(summary.lost_workers >= 2, "lost {}", summary.lost_workers);
    assert!(summary.peak_vus <= 4);
    assert!(summary.iterations > 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_samples_are_counted_as_lost() {
    let workload = workload_fn(|_vu, reporter| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        reporter.report("custom", f64::NAN, Outcome::Success, Tags::new());
        reporter.report("custom", 1.0, Outcome::Success, Tags::new());
        Ok(Outcome::Success)
    })
    .with_metrics(["custom"]);

    let config = RunConfig::new("lossy")
        .with_stage(Duration::ZERO, 1)
        .with_stage(Duration::from_secs(1), 1);

    let summary = RunController::new(config, workload).run().await.unwrap();

    let custom = summary.metric("custom").unwrap();
    assert_eq!(summary.lost_samples, custom.count);
    assert!(summary.lost_samples > 0);
}
